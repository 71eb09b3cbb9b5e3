use std::time::Duration;

use gluelink_frame::{ChecksumMode, PoolConfig};
use gluelink_transport::{
    ConfigError, DataBits, FlowControl, Parity, SerialConfig, StopBits, TcpConfig,
    TransportConfig, TransportKind, TransportOption,
};
use serde::{Deserialize, Serialize};

/// Per-link settings: the endpoint plus reconnect, heartbeat and framing
/// policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub transport: TransportConfig,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// How long a connect attempt may take before it counts as failed.
    pub connect_timeout_ms: u64,
    pub enable_heartbeat: bool,
    pub heartbeat_interval_ms: u64,
    pub statistics_interval_ms: u64,
    /// Suppress error events during automatic retries; the final failure is
    /// still reported.
    pub silent: bool,
    pub checksum: ChecksumMode,
    pub accept_alternate_checksum: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(TransportConfig::Tcp(TcpConfig::default()))
    }
}

impl LinkConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            auto_reconnect: true,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 3,
            connect_timeout_ms: 10_000,
            enable_heartbeat: true,
            heartbeat_interval_ms: 3000,
            statistics_interval_ms: 1000,
            silent: false,
            checksum: ChecksumMode::Crc16Modbus,
            accept_alternate_checksum: true,
        }
    }

    pub fn serial(config: SerialConfig) -> Self {
        Self::new(TransportConfig::Serial(config))
    }

    pub fn tcp(config: TcpConfig) -> Self {
        Self::new(TransportConfig::Tcp(config))
    }

    /// Defaults for a medium.
    pub fn for_kind(kind: TransportKind) -> Self {
        Self::new(TransportConfig::default_for(kind))
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        if self.auto_reconnect && self.reconnect_interval_ms == 0 {
            return Err(ConfigError::new(
                "reconnect_interval_ms",
                "must be greater than zero when auto_reconnect is on",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::new("connect_timeout_ms", "must be greater than zero"));
        }
        if self.enable_heartbeat && self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::new(
                "heartbeat_interval_ms",
                "must be greater than zero when heartbeats are on",
            ));
        }
        if self.statistics_interval_ms == 0 {
            return Err(ConfigError::new("statistics_interval_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Settings for a [`LinkManager`](crate::LinkManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_connections: usize,
    pub monitoring_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Disconnected links idle longer than this are removed.
    pub idle_reap_secs: u64,
    pub queue_capacity: usize,
    /// Work items older than this at admission or dequeue are discarded.
    pub max_item_age_ms: u64,
    /// Per-link read wait on each pass of the link thread.
    pub poll_slice_ms: u64,
    /// How long shutdown waits for the frame worker to drain the queue.
    pub shutdown_grace_ms: u64,
    pub pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            monitoring_interval_ms: 1000,
            health_check_interval_ms: 30_000,
            cleanup_interval_ms: 60_000,
            idle_reap_secs: 3600,
            queue_capacity: 1000,
            max_item_age_ms: 30_000,
            poll_slice_ms: 5,
            shutdown_grace_ms: 3000,
            pool: PoolConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn idle_reap(&self) -> Duration {
        Duration::from_secs(self.idle_reap_secs)
    }

    pub fn max_item_age(&self) -> Duration {
        Duration::from_millis(self.max_item_age_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections", self.max_connections as u64),
            ("monitoring_interval_ms", self.monitoring_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("queue_capacity", self.queue_capacity as u64),
            ("max_item_age_ms", self.max_item_age_ms),
            ("poll_slice_ms", self.poll_slice_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::new(field, "must be greater than zero"));
            }
        }
        if !self.pool.enable_thread_safety {
            return Err(ConfigError::new(
                "pool.enable_thread_safety",
                "the pool is shared between the link thread and callers",
            ));
        }
        self.pool
            .validate()
            .map_err(|e| ConfigError::new("pool", e.to_string()))
    }
}

/// A single runtime change to a link's configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigUpdate {
    BaudRate(u32),
    DataBits(DataBits),
    Parity(Parity),
    StopBits(StopBits),
    FlowControl(FlowControl),
    ReadTimeout(Duration),
    WriteTimeout(Duration),
    KeepAlive(bool),
    Heartbeat(bool),
    HeartbeatInterval(Duration),
    AutoReconnect(bool),
    MaxReconnectAttempts(u32),
    ReconnectInterval(Duration),
    Silent(bool),
}

impl ConfigUpdate {
    /// The equivalent endpoint setting, for updates that touch the endpoint.
    pub fn transport_option(&self) -> Option<TransportOption> {
        Some(match *self {
            ConfigUpdate::BaudRate(v) => TransportOption::BaudRate(v),
            ConfigUpdate::DataBits(v) => TransportOption::DataBits(v),
            ConfigUpdate::Parity(v) => TransportOption::Parity(v),
            ConfigUpdate::StopBits(v) => TransportOption::StopBits(v),
            ConfigUpdate::FlowControl(v) => TransportOption::FlowControl(v),
            ConfigUpdate::ReadTimeout(v) => TransportOption::ReadTimeout(v),
            ConfigUpdate::WriteTimeout(v) => TransportOption::WriteTimeout(v),
            ConfigUpdate::KeepAlive(v) => TransportOption::KeepAlive(v),
            _ => return None,
        })
    }

    /// Apply to a configuration, validating the result.
    ///
    /// On error `config` is left unchanged.
    pub fn apply(&self, config: &mut LinkConfig) -> Result<(), ConfigError> {
        let mut next = config.clone();
        match (*self, &mut next.transport) {
            (ConfigUpdate::BaudRate(v), TransportConfig::Serial(s)) => s.baud_rate = v,
            (ConfigUpdate::DataBits(v), TransportConfig::Serial(s)) => s.data_bits = v,
            (ConfigUpdate::Parity(v), TransportConfig::Serial(s)) => s.parity = v,
            (ConfigUpdate::StopBits(v), TransportConfig::Serial(s)) => s.stop_bits = v,
            (ConfigUpdate::FlowControl(v), TransportConfig::Serial(s)) => s.flow_control = v,
            (ConfigUpdate::KeepAlive(v), TransportConfig::Tcp(t)) => t.keep_alive = v,
            (ConfigUpdate::ReadTimeout(v), TransportConfig::Serial(s)) => {
                s.read_timeout_ms = millis(v)
            }
            (ConfigUpdate::ReadTimeout(v), TransportConfig::Tcp(t)) => t.read_timeout_ms = millis(v),
            (ConfigUpdate::WriteTimeout(v), TransportConfig::Serial(s)) => {
                s.write_timeout_ms = millis(v)
            }
            (ConfigUpdate::WriteTimeout(v), TransportConfig::Tcp(t)) => {
                t.write_timeout_ms = millis(v)
            }
            (ConfigUpdate::Heartbeat(v), _) => next.enable_heartbeat = v,
            (ConfigUpdate::HeartbeatInterval(v), _) => next.heartbeat_interval_ms = millis(v),
            (ConfigUpdate::AutoReconnect(v), _) => next.auto_reconnect = v,
            (ConfigUpdate::MaxReconnectAttempts(v), _) => next.max_reconnect_attempts = v,
            (ConfigUpdate::ReconnectInterval(v), _) => next.reconnect_interval_ms = millis(v),
            (ConfigUpdate::Silent(v), _) => next.silent = v,
            (update, transport) => {
                let option = update.transport_option().map_or("update", |o| o.name());
                return Err(ConfigError::new(
                    option,
                    format!("not applicable to a {} link", transport.kind()),
                ));
            }
        }
        next.validate()?;
        *config = next;
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
