use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::TcpConfig;
use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportKind, TransportOption};

/// TCP client transport.
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    current_read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
            current_read_timeout: None,
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }

    fn connect_any(&self) -> Result<TcpStream> {
        let addr = self.config.address();
        let candidates = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout()) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        Err(TransportError::Connect {
            addr,
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no addresses")
            }),
        })
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoint(&self) -> String {
        self.config.address()
    }

    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = self.connect_any()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.config.write_timeout()))?;
        stream.set_read_timeout(Some(self.config.read_timeout()))?;
        set_keep_alive(&stream, self.config.keep_alive)?;

        info!(addr = %self.config.address(), "tcp connection established");
        self.current_read_timeout = Some(self.config.read_timeout());
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(addr = %self.config.address(), "tcp connection closed");
        }
        self.current_read_timeout = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        // A zero timeout means "block forever" to the socket layer.
        let timeout = timeout.max(Duration::from_millis(1));
        let needs_timeout = self.current_read_timeout != Some(timeout);
        let stream = self.stream_mut()?;
        if needs_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        self.current_read_timeout = Some(timeout);

        let stream = self.stream_mut()?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let write_timeout = self.config.write_timeout();
        let stream = self.stream_mut()?;
        match stream.write(data) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                Err(TransportError::Timeout(write_timeout))
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn set_option(&mut self, option: TransportOption) -> Result<()> {
        match option {
            TransportOption::ReadTimeout(timeout) => {
                self.config.read_timeout_ms = timeout.as_millis() as u64;
            }
            TransportOption::WriteTimeout(timeout) => {
                self.config.write_timeout_ms = timeout.as_millis() as u64;
                if let Some(stream) = self.stream.as_ref() {
                    stream.set_write_timeout(Some(timeout.max(Duration::from_millis(1))))?;
                }
            }
            TransportOption::KeepAlive(enabled) => {
                self.config.keep_alive = enabled;
                if let Some(stream) = self.stream.as_ref() {
                    set_keep_alive(stream, enabled)?;
                }
            }
            TransportOption::BaudRate(_)
            | TransportOption::DataBits(_)
            | TransportOption::Parity(_)
            | TransportOption::StopBits(_)
            | TransportOption::FlowControl(_) => {
                return Err(TransportError::UnsupportedOption {
                    option: option.name(),
                    kind: TransportKind::Tcp,
                });
            }
        }
        debug!(addr = %self.config.address(), option = option.name(), "tcp option applied");
        Ok(())
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.config.address())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[cfg(unix)]
fn set_keep_alive(stream: &TcpStream, enabled: bool) -> Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = i32::from(enabled);

    // SAFETY: `value` is a valid readable c_int for the provided length, and
    // the descriptor belongs to a connected socket owned by `stream`.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc == 0 {
        Ok(())
    } else {
        Err(TransportError::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn set_keep_alive(_stream: &TcpStream, enabled: bool) -> Result<()> {
    if enabled {
        debug!("keep-alive not configurable on this platform; using system default");
    }
    Ok(())
}
