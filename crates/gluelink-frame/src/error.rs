/// Errors that can occur while building frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit the one-byte length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A parameter name does not fit its one-byte length prefix.
    #[error("parameter name too long ({0} bytes, max 255)")]
    NameTooLong(usize),

    /// A string parameter value does not fit its one-byte length prefix.
    #[error("string value too long ({0} bytes, max 255)")]
    ValueTooLong(usize),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A well-framed payload that does not match its command's encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Fewer bytes than the encoding requires.
    #[error("{what} payload too short ({got} bytes, need {need})")]
    TooShort {
        what: &'static str,
        got: usize,
        need: usize,
    },

    /// A fixed-size payload with the wrong size.
    #[error("{what} payload must be exactly {expected} bytes (got {got})")]
    WrongSize {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    /// The parameter type tag is not one of int/float/string/bool.
    #[error("unknown parameter type tag 0x{0:02X}")]
    UnknownParamType(u8),

    /// The heartbeat type byte is neither PING nor PONG.
    #[error("unknown heartbeat type 0x{0:02X}")]
    UnknownHeartbeatType(u8),

    /// A text field is not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// The payload is empty but the command requires data.
    #[error("{0} payload is empty")]
    Empty(&'static str),
}

/// Errors returned by the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The buffer was checked out from a different pool.
    #[error("buffer {buffer} belongs to pool {owner}, not pool {pool}")]
    ForeignBuffer { buffer: u64, owner: u64, pool: u64 },

    /// The buffer is not currently checked out (already released or the
    /// pool was cleared since).
    #[error("buffer {0} is not checked out from this pool")]
    NotOutstanding(u64),

    /// A pool setting is out of range.
    #[error("invalid pool config `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}
