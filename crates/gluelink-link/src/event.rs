use std::fmt;

use bytes::Bytes;
use crossbeam_channel::Sender;
use gluelink_frame::{ChecksumFault, ChecksumMode, Frame, FramingFault, PayloadError, PoolEvent};
use gluelink_transport::TransportKind;

use crate::state::{AggregateStats, LinkState};

/// Notifications published by links and the manager.
///
/// Delivered on the link thread or the frame worker, never on the caller's
/// thread.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Created {
        name: String,
        kind: TransportKind,
    },
    Removed {
        name: String,
    },
    Connected {
        name: String,
    },
    Disconnected {
        name: String,
    },
    StateChanged {
        name: String,
        state: LinkState,
    },
    /// Operator-visible fault. Suppressed during retries in silent mode.
    Error {
        name: String,
        message: String,
    },
    /// A connect attempt failed; `attempt` counts failures since the last
    /// successful connection.
    ReconnectAttempt {
        name: String,
        attempt: u32,
    },
    DataReceived {
        name: String,
        data: Bytes,
    },
    DataSent {
        name: String,
        data: Bytes,
    },
    FrameReceived {
        name: String,
        frame: Frame,
    },
    FrameSent {
        name: String,
        frame: Frame,
    },
    /// A well-framed payload that does not match its command.
    ProtocolError {
        name: String,
        frame: Frame,
        error: PayloadError,
    },
    FramingError {
        name: String,
        fault: FramingFault,
    },
    ChecksumError {
        name: String,
        code: u8,
        mode: ChecksumMode,
        fault: ChecksumFault,
    },
    /// The receive buffer overflowed and was cleared.
    Overflow {
        name: String,
        discarded: usize,
    },
    /// First frame seen with a code outside the command set.
    UnknownCommand {
        name: String,
        code: u8,
    },
    HeartbeatRtt {
        name: String,
        rtt_ms: f64,
    },
    /// A connected link has been quiet for more than two heartbeat intervals.
    LinkInactive {
        name: String,
        idle_ms: u64,
    },
    /// The dispatch queue was full; `evicted` is false when the new frame
    /// itself was dropped.
    QueueOverflow {
        name: String,
        evicted: bool,
    },
    PrimaryChanged {
        name: Option<String>,
    },
    StatsUpdated(AggregateStats),
    Pool(PoolEvent),
}

impl LinkEvent {
    /// Stable event name for logs and machine-readable output.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::Created { .. } => "created",
            LinkEvent::Removed { .. } => "removed",
            LinkEvent::Connected { .. } => "connected",
            LinkEvent::Disconnected { .. } => "disconnected",
            LinkEvent::StateChanged { .. } => "state_changed",
            LinkEvent::Error { .. } => "error",
            LinkEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            LinkEvent::DataReceived { .. } => "data_received",
            LinkEvent::DataSent { .. } => "data_sent",
            LinkEvent::FrameReceived { .. } => "frame_received",
            LinkEvent::FrameSent { .. } => "frame_sent",
            LinkEvent::ProtocolError { .. } => "protocol_error",
            LinkEvent::FramingError { .. } => "framing_error",
            LinkEvent::ChecksumError { .. } => "checksum_error",
            LinkEvent::Overflow { .. } => "overflow",
            LinkEvent::UnknownCommand { .. } => "unknown_command",
            LinkEvent::HeartbeatRtt { .. } => "heartbeat_rtt",
            LinkEvent::LinkInactive { .. } => "link_inactive",
            LinkEvent::QueueOverflow { .. } => "queue_overflow",
            LinkEvent::PrimaryChanged { .. } => "primary_changed",
            LinkEvent::StatsUpdated(_) => "stats_updated",
            LinkEvent::Pool(_) => "pool",
        }
    }

    /// The link this event concerns, if any.
    pub fn link(&self) -> Option<&str> {
        match self {
            LinkEvent::Created { name, .. }
            | LinkEvent::Removed { name }
            | LinkEvent::Connected { name }
            | LinkEvent::Disconnected { name }
            | LinkEvent::StateChanged { name, .. }
            | LinkEvent::Error { name, .. }
            | LinkEvent::ReconnectAttempt { name, .. }
            | LinkEvent::DataReceived { name, .. }
            | LinkEvent::DataSent { name, .. }
            | LinkEvent::FrameReceived { name, .. }
            | LinkEvent::FrameSent { name, .. }
            | LinkEvent::ProtocolError { name, .. }
            | LinkEvent::FramingError { name, .. }
            | LinkEvent::ChecksumError { name, .. }
            | LinkEvent::Overflow { name, .. }
            | LinkEvent::UnknownCommand { name, .. }
            | LinkEvent::HeartbeatRtt { name, .. }
            | LinkEvent::LinkInactive { name, .. }
            | LinkEvent::QueueOverflow { name, .. } => Some(name.as_str()),
            LinkEvent::PrimaryChanged { name } => name.as_deref(),
            LinkEvent::StatsUpdated(_) | LinkEvent::Pool(_) => None,
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Created { name, kind } => write!(f, "{name}: created ({kind})"),
            LinkEvent::StateChanged { name, state } => write!(f, "{name}: {state}"),
            LinkEvent::Error { name, message } => write!(f, "{name}: error: {message}"),
            LinkEvent::ReconnectAttempt { name, attempt } => {
                write!(f, "{name}: reconnect attempt {attempt}")
            }
            LinkEvent::DataReceived { name, data } | LinkEvent::DataSent { name, data } => {
                write!(f, "{name}: {} {} bytes", self.kind(), data.len())
            }
            LinkEvent::FrameReceived { name, frame } | LinkEvent::FrameSent { name, frame } => {
                write!(
                    f,
                    "{name}: {} 0x{:02X} ({} bytes)",
                    self.kind(),
                    frame.code,
                    frame.payload.len()
                )
            }
            LinkEvent::ProtocolError { name, error, .. } => {
                write!(f, "{name}: protocol error: {error}")
            }
            LinkEvent::ChecksumError { name, code, fault, .. } => {
                write!(f, "{name}: checksum error on 0x{code:02X}: {fault}")
            }
            LinkEvent::Overflow { name, discarded } => {
                write!(f, "{name}: receive overflow, {discarded} bytes dropped")
            }
            LinkEvent::UnknownCommand { name, code } => {
                write!(f, "{name}: unknown command 0x{code:02X}")
            }
            LinkEvent::HeartbeatRtt { name, rtt_ms } => write!(f, "{name}: rtt {rtt_ms:.1} ms"),
            LinkEvent::LinkInactive { name, idle_ms } => {
                write!(f, "{name}: inactive for {idle_ms} ms")
            }
            LinkEvent::PrimaryChanged { name } => {
                write!(f, "primary: {}", name.as_deref().unwrap_or("none"))
            }
            LinkEvent::StatsUpdated(agg) => write!(
                f,
                "stats: {}/{} connected, {} in / {} out",
                agg.connected, agg.links, agg.bytes_in, agg.bytes_out
            ),
            LinkEvent::Pool(ev) => write!(f, "pool: {ev:?}"),
            other => match other.link() {
                Some(name) => write!(f, "{name}: {}", other.kind()),
                None => f.write_str(other.kind()),
            },
        }
    }
}

/// Receives [`LinkEvent`]s. Must not block for long; it runs on the link
/// thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LinkEvent);
}

impl<F> EventSink for F
where
    F: Fn(LinkEvent) + Send + Sync,
{
    fn emit(&self, event: LinkEvent) {
        self(event)
    }
}

/// Forwards events into a channel. Sends to a dropped receiver are ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub Sender<LinkEvent>);

impl EventSink for ChannelSink {
    fn emit(&self, event: LinkEvent) {
        let _ = self.0.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LinkEvent) {}
}
