use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DataBits, FlowControl, Parity, StopBits};
use crate::error::{Result, TransportError};

/// The two wire media a link can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Serial,
    Tcp,
}

impl TransportKind {
    /// Prefix used when generating link names (`Serial_1`, `TCP_2`).
    pub fn name_prefix(self) -> &'static str {
        match self {
            TransportKind::Serial => "Serial",
            TransportKind::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name_prefix())
    }
}

/// A single setting that can be re-applied to an open endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportOption {
    BaudRate(u32),
    DataBits(DataBits),
    Parity(Parity),
    StopBits(StopBits),
    FlowControl(FlowControl),
    ReadTimeout(Duration),
    WriteTimeout(Duration),
    KeepAlive(bool),
}

impl TransportOption {
    pub fn name(&self) -> &'static str {
        match self {
            TransportOption::BaudRate(_) => "baud_rate",
            TransportOption::DataBits(_) => "data_bits",
            TransportOption::Parity(_) => "parity",
            TransportOption::StopBits(_) => "stop_bits",
            TransportOption::FlowControl(_) => "flow_control",
            TransportOption::ReadTimeout(_) => "read_timeout",
            TransportOption::WriteTimeout(_) => "write_timeout",
            TransportOption::KeepAlive(_) => "keep_alive",
        }
    }
}

/// A reliable bidirectional byte stream.
///
/// Implementations are driven from a single thread; they must be `Send` so
/// the owning link can move to that thread.
pub trait Transport: Send {
    /// Which medium this endpoint uses.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint description for logs (`/dev/ttyUSB0@9600`,
    /// `10.0.0.5:502`).
    fn endpoint(&self) -> String;

    /// Open the endpoint. Opening an already open transport is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Close the endpoint. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Whether the endpoint currently reports itself open.
    fn is_open(&self) -> bool;

    /// Read available bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when no bytes arrived within the timeout; idle is not
    /// an error. Returns `Err(TransportError::Closed)` when the peer closed
    /// the stream.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write some bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Apply a setting, to the open endpoint if there is one and to the
    /// stored configuration in any case.
    fn set_option(&mut self, option: TransportOption) -> Result<()>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            match self.write(&data[offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => offset += n,
                Err(TransportError::Io(err)) if err.kind() == std::io::ErrorKind::Interrupted => {
                    continue
                }
                Err(TransportError::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    continue
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn set_option(&mut self, option: TransportOption) -> Result<()> {
        (**self).set_option(option)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data)
    }
}
