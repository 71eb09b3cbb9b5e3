//! Device links for glue dispensing controllers.
//!
//! gluelink talks to dispenser controllers over RS-232 serial lines and
//! TCP sockets using a small framed binary protocol.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream endpoints (serial port, TCP client)
//! - [`frame`]: checksums, frame encoding and resynchronizing decoding,
//!   typed payloads, buffer pooling
//! - [`link`]: per-link state machines with reconnect and heartbeat, and
//!   the multi-link manager

/// Re-export transport types.
pub mod transport {
    pub use gluelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use gluelink_frame::*;
}

/// Re-export link and manager types.
pub mod link {
    pub use gluelink_link::*;
}

pub use gluelink_frame::{ChecksumMode, Command, Frame};
pub use gluelink_link::{LinkConfig, LinkEvent, LinkManager, LinkState, ManagerConfig};
pub use gluelink_transport::{SerialConfig, TcpConfig, TransportKind};
