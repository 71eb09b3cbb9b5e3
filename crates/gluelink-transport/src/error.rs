use std::time::Duration;

use crate::traits::TransportKind;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open the named serial port.
    #[error("failed to open serial port {port}: {source}")]
    OpenSerial {
        port: String,
        source: serialport::Error,
    },

    /// Failed to connect to the TCP endpoint.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// The serial driver reported an error on an open port.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation requires an open transport.
    #[error("transport not open")]
    NotOpen,

    /// The remote end closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// The operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The option does not apply to this kind of transport.
    #[error("option {option} not supported by {kind} transport")]
    UnsupportedOption {
        option: &'static str,
        kind: TransportKind,
    },
}

impl TransportError {
    /// True when the error means the stream is gone rather than a single
    /// operation having failed.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed | TransportError::NotOpen => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A configuration value was malformed or out of range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
