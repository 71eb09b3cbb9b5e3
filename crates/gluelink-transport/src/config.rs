//! Endpoint configuration.
//!
//! All durations are carried as milliseconds so documents stay readable
//! when serialized; accessor methods return [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::traits::TransportKind;

/// Default serial line speed.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Default controller port (Modbus/TCP convention used by the machine firmware).
pub const DEFAULT_TCP_PORT: u16 = 502;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ConfigError::new("data_bits", format!("{other} (expected 5-8)"))),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(ConfigError::new("stop_bits", format!("{other} (expected 1 or 2)"))),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Default port timeout for blocking reads. The link thread passes its
    /// own poll slice to every read, so this does not bound waits there.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_name.trim().is_empty() {
            return Err(ConfigError::new("port_name", "must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::new("baud_rate", "must be greater than zero"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::new("read_timeout_ms", "must be greater than zero"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::new("write_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// TCP endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Socket read timeout set on connect. Not applied on the link thread,
    /// whose reads wait at most the manager's poll slice.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub keep_alive: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            connect_timeout_ms: 5000,
            read_timeout_ms: 3000,
            write_timeout_ms: 3000,
            keep_alive: true,
        }
    }
}

impl TcpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::new("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::new("port", "must be greater than zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::new("connect_timeout_ms", "must be greater than zero"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::new("read_timeout_ms", "must be greater than zero"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::new("write_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Endpoint configuration for either medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Tcp(TcpConfig),
}

impl TransportConfig {
    /// Default settings for a medium.
    pub fn default_for(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Serial => TransportConfig::Serial(SerialConfig::default()),
            TransportKind::Tcp => TransportConfig::Tcp(TcpConfig::default()),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Serial(_) => TransportKind::Serial,
            TransportConfig::Tcp(_) => TransportKind::Tcp,
        }
    }

    /// Per-read timeout configured for the endpoint.
    pub fn read_timeout(&self) -> Duration {
        match self {
            TransportConfig::Serial(c) => c.read_timeout(),
            TransportConfig::Tcp(c) => c.read_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            TransportConfig::Serial(c) => c.validate(),
            TransportConfig::Tcp(c) => c.validate(),
        }
    }
}
