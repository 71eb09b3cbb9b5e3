use std::fmt;
use std::time::{Duration, Instant};

use gluelink_frame::ParseStats;
use gluelink_transport::TransportKind;
use serde::Serialize;

use crate::config::LinkConfig;

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Error => "error",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-link traffic and fault counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub framing_errors: u64,
    pub checksum_errors: u64,
    pub protocol_errors: u64,
    pub overflows: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub last_rtt_ms: Option<f64>,
    /// Smoothed heartbeat round trip.
    pub avg_latency_ms: Option<f64>,
}

/// Link state shared between the link thread and callers.
///
/// Guarded by the link's own mutex; the link thread is the only writer of
/// `state`.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: LinkState,
    pub stats: LinkStats,
    /// Decoder counters, refreshed on each statistics tick.
    pub parse: ParseStats,
    pub config: LinkConfig,
    pub endpoint: String,
    pub last_activity: Instant,
    pub connected_at: Option<Instant>,
    pub retry: u32,
    pub last_error: Option<String>,
    /// Set by the health check when a connected link has gone quiet.
    pub inactive: bool,
}

impl LinkStatus {
    pub fn new(config: LinkConfig, endpoint: String, now: Instant) -> Self {
        Self {
            state: LinkState::Disconnected,
            stats: LinkStats::default(),
            parse: ParseStats::default(),
            config,
            endpoint,
            last_activity: now,
            connected_at: None,
            retry: 0,
            last_error: None,
            inactive: false,
        }
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Point-in-time view of one link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub name: String,
    pub kind: TransportKind,
    pub endpoint: String,
    pub state: LinkState,
    pub priority: i32,
    pub retry: u32,
    pub last_error: Option<String>,
    pub inactive: bool,
    pub idle_ms: u64,
    pub uptime_ms: Option<u64>,
    pub age_ms: u64,
    pub stats: LinkStats,
    pub parse: ParseStats,
}

/// Totals across every link.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub links: usize,
    pub connected: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub queue_depth: usize,
}

impl AggregateStats {
    pub fn add(&mut self, status: &LinkStatus) {
        self.links += 1;
        if status.state == LinkState::Connected {
            self.connected += 1;
        }
        let s = &status.stats;
        self.bytes_in += s.bytes_in;
        self.bytes_out += s.bytes_out;
        self.frames_in += s.frames_in;
        self.frames_out += s.frames_out;
        self.errors += s.errors;
        self.reconnects += s.reconnects;
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
