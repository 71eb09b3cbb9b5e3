use gluelink_transport::{ConfigError, TransportKind};

/// Errors returned by link and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] gluelink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] gluelink_frame::FrameError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The operation needs a connected link.
    #[error("link {0} is not connected")]
    NotConnected(String),

    /// No link with this name.
    #[error("no link named {0}")]
    NotFound(String),

    /// A link with this name already exists.
    #[error("a link named {0} already exists")]
    Duplicate(String),

    /// The manager is at its connection limit.
    #[error("connection limit reached ({0})")]
    TooManyLinks(usize),

    /// The configuration is for a different medium than the link.
    #[error("link {name} is {expected}, configuration is for {got}")]
    KindMismatch {
        name: String,
        expected: TransportKind,
        got: TransportKind,
    },

    /// The manager has shut down.
    #[error("link manager is shut down")]
    ShutDown,

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
