use std::time::{Duration, Instant};

/// Weight of the newest sample in the latency average.
const EWMA_ALPHA: f64 = 0.2;

/// The peer is considered absent after this many silent intervals.
pub const TIMEOUT_INTERVALS: u32 = 3;

/// Tracks outstanding PINGs and smooths round-trip times.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    interval: Duration,
    pending: Option<Instant>,
    last_rtt: Option<Duration>,
    avg_latency_ms: Option<f64>,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            last_rtt: None,
            avg_latency_ms: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Silence longer than this means the peer is gone.
    pub fn timeout(&self) -> Duration {
        self.interval * TIMEOUT_INTERVALS
    }

    pub fn is_timed_out(&self, last_activity: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_activity) > self.timeout()
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.pending = Some(now);
    }

    /// Record a PONG. Returns the round trip if a PING was outstanding.
    pub fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.pending.take()?;
        let rtt = now.saturating_duration_since(sent);
        let sample = rtt.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * avg,
            None => sample,
        });
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        self.avg_latency_ms
    }

    /// Forget the outstanding PING (on reconnect).
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
