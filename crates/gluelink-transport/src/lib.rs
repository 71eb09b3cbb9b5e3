//! Byte-stream endpoints for dispensing-machine device links.
//!
//! Provides one small capability set over the two supported wire media:
//! - Serial ports (RS-232/RS-485 adapters)
//! - TCP sockets (Ethernet-attached controllers)
//!
//! This is the lowest layer of gluelink. Everything else builds on top of
//! the [`Transport`] trait provided here.

pub mod config;
pub mod error;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use config::{DataBits, FlowControl, Parity, SerialConfig, StopBits, TcpConfig, TransportConfig};
pub use error::{ConfigError, Result, TransportError};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use traits::{Transport, TransportKind, TransportOption};

/// Build a boxed transport for the given configuration.
///
/// The transport is returned closed; call [`Transport::open`] to connect.
pub fn build_transport(config: &TransportConfig) -> Box<dyn Transport> {
    match config {
        TransportConfig::Serial(serial) => Box::new(SerialTransport::new(serial.clone())),
        TransportConfig::Tcp(tcp) => Box::new(TcpTransport::new(tcp.clone())),
    }
}
