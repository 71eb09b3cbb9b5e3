use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportKind, TransportOption};

/// Serial port transport.
///
/// Wraps a `serialport` handle. Line settings changed while the port is
/// open are pushed to the driver immediately.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    current_timeout: Option<Duration>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            current_timeout: None,
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.config.port_name, self.config.baud_rate)
    }

    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .timeout(self.config.read_timeout())
            .open()
            .map_err(|source| TransportError::OpenSerial {
                port: self.config.port_name.clone(),
                source,
            })?;

        info!(port = %self.config.port_name, baud = self.config.baud_rate, "serial port opened");
        self.current_timeout = Some(self.config.read_timeout());
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.config.port_name, "serial port closed");
        }
        self.current_timeout = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let timeout = timeout.max(Duration::from_millis(1));
        let needs_timeout = self.current_timeout != Some(timeout);
        let port = self.port_mut()?;
        if needs_timeout {
            port.set_timeout(timeout)?;
        }
        self.current_timeout = Some(timeout);

        let port = self.port_mut()?;
        match Read::read(port, buf) {
            Ok(n) => Ok(n),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        // Writes share the driver timeout with reads; use the write budget.
        let write_timeout = self.config.write_timeout();
        let needs_timeout = self.current_timeout != Some(write_timeout);
        let port = self.port_mut()?;
        if needs_timeout {
            port.set_timeout(write_timeout)?;
        }
        self.current_timeout = Some(write_timeout);

        let port = self.port_mut()?;
        match Write::write(port, data) {
            Ok(n) => {
                Write::flush(port)?;
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                Err(TransportError::Timeout(write_timeout))
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn set_option(&mut self, option: TransportOption) -> Result<()> {
        match option {
            TransportOption::BaudRate(baud) => {
                self.config.baud_rate = baud;
                if let Some(port) = self.port.as_mut() {
                    port.set_baud_rate(baud)?;
                }
            }
            TransportOption::DataBits(bits) => {
                self.config.data_bits = bits;
                if let Some(port) = self.port.as_mut() {
                    port.set_data_bits(bits.into())?;
                }
            }
            TransportOption::Parity(parity) => {
                self.config.parity = parity;
                if let Some(port) = self.port.as_mut() {
                    port.set_parity(parity.into())?;
                }
            }
            TransportOption::StopBits(bits) => {
                self.config.stop_bits = bits;
                if let Some(port) = self.port.as_mut() {
                    port.set_stop_bits(bits.into())?;
                }
            }
            TransportOption::FlowControl(flow) => {
                self.config.flow_control = flow;
                if let Some(port) = self.port.as_mut() {
                    port.set_flow_control(flow.into())?;
                }
            }
            TransportOption::ReadTimeout(timeout) => {
                self.config.read_timeout_ms = timeout.as_millis() as u64;
            }
            TransportOption::WriteTimeout(timeout) => {
                self.config.write_timeout_ms = timeout.as_millis() as u64;
            }
            TransportOption::KeepAlive(_) => {
                return Err(TransportError::UnsupportedOption {
                    option: option.name(),
                    kind: TransportKind::Serial,
                });
            }
        }
        debug!(port = %self.config.port_name, option = option.name(), "serial option applied");
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.config.port_name)
            .field("baud", &self.config.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_port_reports_port_name() {
        let mut t = SerialTransport::new(SerialConfig::new("/dev/gluelink-does-not-exist"));
        let err = t.open().unwrap_err();
        match err {
            TransportError::OpenSerial { port, .. } => {
                assert_eq!(port, "/dev/gluelink-does-not-exist")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!t.is_open());
    }

    #[test]
    fn closed_port_rejects_io() {
        let mut t = SerialTransport::new(SerialConfig::new("/dev/null-port"));
        let mut buf = [0u8; 4];
        assert!(matches!(
            t.read(&mut buf, Duration::from_millis(1)),
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(t.write(b"x"), Err(TransportError::NotOpen)));
    }

    #[test]
    fn options_update_config_while_closed() {
        let mut t = SerialTransport::new(SerialConfig::new("COM1"));
        t.set_option(TransportOption::BaudRate(115_200)).unwrap();
        t.set_option(TransportOption::Parity(crate::Parity::Even)).unwrap();
        assert_eq!(t.config().baud_rate, 115_200);
        assert_eq!(t.config().parity, crate::Parity::Even);
        assert_eq!(t.endpoint(), "COM1@115200");
    }

    #[test]
    fn keep_alive_is_not_a_serial_option() {
        let mut t = SerialTransport::new(SerialConfig::new("COM1"));
        let err = t.set_option(TransportOption::KeepAlive(true)).unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedOption { .. }));
    }
}
