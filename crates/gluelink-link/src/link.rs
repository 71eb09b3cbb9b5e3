//! The per-link connection state machine.
//!
//! A [`Link`] is owned and driven by the link thread. Every entry point
//! takes the current time and the shared [`TimerWheel`], and reports what
//! happened through an [`Outbox`] instead of calling out directly, so the
//! machine can be stepped deterministically.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gluelink_frame::{
    encode, validate_payload, Command, DecodeEvent, DecoderConfig, Frame, FrameDecoder, Heartbeat,
    SharedBufferPool, MAX_BUFFER_SIZE,
};
use gluelink_transport::{Transport, TransportError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigUpdate, LinkConfig};
use crate::error::{LinkError, Result};
use crate::event::LinkEvent;
use crate::heartbeat::HeartbeatTracker;
use crate::state::{millis, LinkState, LinkStatus};
use crate::timer::{LinkId, TimerId, TimerKind, TimerWheel};

/// Bytes requested from the transport per read.
pub const READ_CHUNK: usize = 512;

/// What a link step produced.
#[derive(Debug, Default)]
pub struct Outbox {
    pub events: Vec<LinkEvent>,
    /// Validated frames ready for dispatch, in arrival order.
    pub frames: Vec<Frame>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.frames.is_empty()
    }
}

pub struct Link {
    name: String,
    id: LinkId,
    config: LinkConfig,
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    heartbeat: HeartbeatTracker,
    status: Arc<Mutex<LinkStatus>>,
    state: LinkState,
    retry: u32,
    /// Set while recovering a connection that was lost, so the next
    /// successful open counts as a reconnect.
    recovering: bool,
    seen_unknown: HashSet<u8>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("endpoint", &self.transport.endpoint())
            .field("retry", &self.retry)
            .finish()
    }
}

fn decoder_for(config: &LinkConfig) -> FrameDecoder {
    FrameDecoder::new(DecoderConfig {
        mode: config.checksum,
        accept_alternate: config.accept_alternate_checksum,
        max_buffer: MAX_BUFFER_SIZE,
    })
}

impl Link {
    pub fn new(
        name: impl Into<String>,
        id: LinkId,
        config: LinkConfig,
        transport: Box<dyn Transport>,
        status: Arc<Mutex<LinkStatus>>,
    ) -> Self {
        {
            let mut s = status.lock();
            s.config = config.clone();
            s.endpoint = transport.endpoint();
        }
        Self {
            name: name.into(),
            id,
            decoder: decoder_for(&config),
            heartbeat: HeartbeatTracker::new(config.heartbeat_interval()),
            config,
            transport,
            status,
            state: LinkState::Disconnected,
            retry: 0,
            recovering: false,
            seen_unknown: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    fn timer(&self, kind: TimerKind) -> TimerId {
        TimerId::Link(self.id, kind)
    }

    fn set_state(&mut self, next: LinkState, out: &mut Outbox) {
        if self.state == next {
            return;
        }
        let prev = self.state;
        self.state = next;
        {
            let mut s = self.status.lock();
            s.state = next;
            s.retry = self.retry;
        }
        debug!(link = %self.name, from = ?prev, to = ?next, "state change");
        out.events.push(LinkEvent::StateChanged {
            name: self.name.clone(),
            state: next,
        });
        if next == LinkState::Connected {
            out.events.push(LinkEvent::Connected {
                name: self.name.clone(),
            });
        } else if prev == LinkState::Connected {
            out.events.push(LinkEvent::Disconnected {
                name: self.name.clone(),
            });
        }
    }

    /// Start connecting. A no-op while already connected or connecting.
    pub fn connect(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        if matches!(self.state, LinkState::Connected | LinkState::Connecting) {
            debug!(link = %self.name, state = ?self.state, "connect ignored");
            return;
        }
        wheel.cancel_link(self.id);
        self.retry = 0;
        self.recovering = false;
        self.begin_connect(now, wheel, out);
    }

    /// Replace configuration and endpoint, then connect.
    pub fn connect_with(
        &mut self,
        now: Instant,
        config: LinkConfig,
        transport: Box<dyn Transport>,
        wheel: &mut TimerWheel,
        out: &mut Outbox,
    ) {
        self.disconnect(wheel, out);
        self.decoder = decoder_for(&config);
        self.heartbeat = HeartbeatTracker::new(config.heartbeat_interval());
        self.transport = transport;
        {
            let mut s = self.status.lock();
            s.config = config.clone();
            s.endpoint = self.transport.endpoint();
        }
        self.config = config;
        self.connect(now, wheel, out);
    }

    pub fn disconnect(&mut self, wheel: &mut TimerWheel, out: &mut Outbox) {
        wheel.cancel_link(self.id);
        self.transport.close();
        self.retry = 0;
        self.recovering = false;
        self.heartbeat.reset();
        if self.state != LinkState::Disconnected {
            info!(link = %self.name, "disconnected");
            self.set_state(LinkState::Disconnected, out);
        }
    }

    /// Drop the connection and connect again from scratch.
    pub fn reconnect(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        self.disconnect(wheel, out);
        self.connect(now, wheel, out);
    }

    fn begin_connect(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        self.set_state(LinkState::Connecting, out);
        wheel.schedule(
            self.timer(TimerKind::ConnectTimeout),
            now + self.config.connect_timeout(),
        );
        self.try_open(now, wheel, out);
    }

    fn try_open(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        let started = Instant::now();
        let result = self.transport.open();
        let elapsed = started.elapsed();
        match result {
            Ok(()) if elapsed > self.config.connect_timeout() => {
                self.transport.close();
                let message = format!("connect timeout after {} ms", millis(elapsed));
                self.connect_failed(now, message, wheel, out);
            }
            Ok(()) => self.on_up(now, wheel, out),
            Err(e) => self.connect_failed(now, e.to_string(), wheel, out),
        }
    }

    fn on_up(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        wheel.cancel(self.timer(TimerKind::ConnectTimeout));
        wheel.cancel(self.timer(TimerKind::Reconnect));
        self.retry = 0;
        self.decoder.clear();
        self.heartbeat.reset();
        let endpoint = self.transport.endpoint();
        {
            let mut s = self.status.lock();
            s.last_activity = now;
            s.connected_at = Some(now);
            s.inactive = false;
            s.endpoint = endpoint.clone();
            if self.recovering {
                s.stats.reconnects += 1;
            }
        }
        self.recovering = false;
        info!(link = %self.name, %endpoint, "connected");
        self.set_state(LinkState::Connected, out);

        if self.config.enable_heartbeat {
            wheel.schedule(
                self.timer(TimerKind::Heartbeat),
                now + self.config.heartbeat_interval(),
            );
        }
        wheel.schedule(
            self.timer(TimerKind::Statistics),
            now + self.config.statistics_interval(),
        );
    }

    fn connect_failed(
        &mut self,
        now: Instant,
        message: String,
        wheel: &mut TimerWheel,
        out: &mut Outbox,
    ) {
        wheel.cancel(self.timer(TimerKind::ConnectTimeout));
        self.retry += 1;
        {
            let mut s = self.status.lock();
            s.stats.errors += 1;
            s.last_error = Some(message.clone());
            s.retry = self.retry;
        }
        warn!(link = %self.name, attempt = self.retry, error = %message, "connect failed");
        if self.config.auto_reconnect {
            out.events.push(LinkEvent::ReconnectAttempt {
                name: self.name.clone(),
                attempt: self.retry,
            });
        }
        self.enter_error(now, message, wheel, out);
    }

    /// Error entry: schedule a retry while the budget lasts, otherwise stop.
    fn enter_error(&mut self, now: Instant, message: String, wheel: &mut TimerWheel, out: &mut Outbox) {
        self.set_state(LinkState::Error, out);
        self.transport.close();
        wheel.cancel(self.timer(TimerKind::Heartbeat));
        wheel.cancel(self.timer(TimerKind::Statistics));
        wheel.cancel(self.timer(TimerKind::ConnectTimeout));

        let retrying =
            self.config.auto_reconnect && self.retry < self.config.max_reconnect_attempts;
        if retrying {
            if !self.config.silent {
                out.events.push(LinkEvent::Error {
                    name: self.name.clone(),
                    message,
                });
            }
            self.recovering = true;
            self.set_state(LinkState::Reconnecting, out);
            wheel.schedule(
                self.timer(TimerKind::Reconnect),
                now + self.config.reconnect_interval(),
            );
            return;
        }

        let message = if self.config.auto_reconnect && self.retry > 0 {
            error!(link = %self.name, attempts = self.retry, "reconnect attempts exhausted");
            format!("{message} (gave up after {} attempts)", self.retry)
        } else {
            message
        };
        out.events.push(LinkEvent::Error {
            name: self.name.clone(),
            message,
        });
        self.recovering = false;
        self.set_state(LinkState::Disconnected, out);
    }

    /// The peer went away while connected.
    fn on_down(&mut self, now: Instant, reason: String, wheel: &mut TimerWheel, out: &mut Outbox) {
        warn!(link = %self.name, %reason, "connection lost");
        self.transport.close();
        wheel.cancel(self.timer(TimerKind::Heartbeat));
        wheel.cancel(self.timer(TimerKind::Statistics));
        self.heartbeat.reset();
        self.status.lock().last_error = Some(reason);

        if self.config.auto_reconnect && self.retry < self.config.max_reconnect_attempts {
            self.recovering = true;
            self.set_state(LinkState::Reconnecting, out);
            wheel.schedule(
                self.timer(TimerKind::Reconnect),
                now + self.config.reconnect_interval(),
            );
        } else {
            self.set_state(LinkState::Disconnected, out);
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        match (kind, self.state) {
            (TimerKind::Heartbeat, LinkState::Connected) => self.heartbeat_tick(now, wheel, out),
            (TimerKind::Reconnect, LinkState::Reconnecting) => {
                debug!(link = %self.name, attempt = self.retry + 1, "reconnecting");
                self.begin_connect(now, wheel, out);
            }
            (TimerKind::ConnectTimeout, LinkState::Connecting) => {
                self.transport.close();
                self.connect_failed(now, "connect timeout".to_string(), wheel, out);
            }
            (TimerKind::Statistics, LinkState::Connected) => {
                self.publish_parse_stats();
                wheel.schedule(
                    self.timer(TimerKind::Statistics),
                    now + self.config.statistics_interval(),
                );
            }
            (kind, state) => trace!(link = %self.name, ?kind, ?state, "stale timer"),
        }
    }

    fn heartbeat_tick(&mut self, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) {
        let last_activity = self.status.lock().last_activity;
        if self.heartbeat.is_timed_out(last_activity, now) {
            let idle = now.saturating_duration_since(last_activity);
            warn!(link = %self.name, idle_ms = millis(idle), "heartbeat timeout");
            self.status.lock().stats.errors += 1;
            self.enter_error(now, "heartbeat timeout".to_string(), wheel, out);
            return;
        }

        if self.write_heartbeat(Heartbeat::ping_now(), now, wheel, out).is_ok() {
            self.heartbeat.on_ping_sent(now);
            self.status.lock().stats.heartbeats_sent += 1;
        }
        if self.state == LinkState::Connected && self.config.enable_heartbeat {
            wheel.schedule(
                self.timer(TimerKind::Heartbeat),
                now + self.config.heartbeat_interval(),
            );
        }
    }

    fn write_heartbeat(
        &mut self,
        heartbeat: Heartbeat,
        now: Instant,
        wheel: &mut TimerWheel,
        out: &mut Outbox,
    ) -> Result<()> {
        let wire = encode(Command::Heartbeat, &heartbeat.encode(), self.config.checksum)?;
        self.transmit(&wire, now, wheel, out)
    }

    /// Write raw bytes to a connected endpoint.
    fn transmit(&mut self, data: &[u8], now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) -> Result<()> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected(self.name.clone()));
        }
        match self.transport.write_all(data) {
            Ok(()) => {
                self.status.lock().stats.bytes_out += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                {
                    let mut s = self.status.lock();
                    s.stats.errors += 1;
                    s.last_error = Some(e.to_string());
                }
                if e.is_disconnect() {
                    self.on_down(now, e.to_string(), wheel, out);
                } else {
                    warn!(link = %self.name, error = %e, "write failed");
                    if !self.config.silent {
                        out.events.push(LinkEvent::Error {
                            name: self.name.clone(),
                            message: format!("write failed: {e}"),
                        });
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Send raw bytes.
    pub fn send(&mut self, data: Bytes, now: Instant, wheel: &mut TimerWheel, out: &mut Outbox) -> Result<()> {
        self.transmit(&data, now, wheel, out)?;
        out.events.push(LinkEvent::DataSent {
            name: self.name.clone(),
            data,
        });
        Ok(())
    }

    /// Encode and send a frame.
    pub fn send_frame(
        &mut self,
        frame: Frame,
        now: Instant,
        wheel: &mut TimerWheel,
        out: &mut Outbox,
    ) -> Result<()> {
        let wire = encode(frame.code, &frame.payload, frame.checksum)?;
        self.transmit(&wire, now, wheel, out)?;
        self.status.lock().stats.frames_out += 1;
        trace!(link = %self.name, code = frame.code, len = frame.payload.len(), "frame sent");
        out.events.push(LinkEvent::FrameSent {
            name: self.name.clone(),
            frame,
        });
        out.events.push(LinkEvent::DataSent {
            name: self.name.clone(),
            data: wire,
        });
        Ok(())
    }

    /// Read once from the endpoint, waiting at most `slice`.
    ///
    /// Returns the number of bytes received.
    pub fn poll(
        &mut self,
        now: Instant,
        slice: Duration,
        pool: &SharedBufferPool,
        wheel: &mut TimerWheel,
        out: &mut Outbox,
    ) -> usize {
        if self.state != LinkState::Connected {
            return 0;
        }
        let mut buf = pool.acquire(READ_CHUNK);
        buf.resize(READ_CHUNK, 0);
        let received = match self.transport.read(&mut buf, slice) {
            Ok(0) | Err(TransportError::Timeout(_)) => 0,
            Ok(n) => {
                self.on_bytes(now, &buf[..n], wheel, out);
                n
            }
            Err(e) if e.is_disconnect() => {
                self.on_down(now, e.to_string(), wheel, out);
                0
            }
            Err(e) => {
                {
                    let mut s = self.status.lock();
                    s.stats.errors += 1;
                    s.last_error = Some(e.to_string());
                }
                self.enter_error(now, e.to_string(), wheel, out);
                0
            }
        };
        if let Err(e) = pool.release(buf) {
            debug!(error = %e, "read buffer not returned to pool");
        }
        received
    }

    /// Feed received bytes through the decoder.
    pub fn on_bytes(&mut self, now: Instant, data: &[u8], wheel: &mut TimerWheel, out: &mut Outbox) {
        {
            let mut s = self.status.lock();
            s.stats.bytes_in += data.len() as u64;
            s.last_activity = now;
            s.inactive = false;
        }
        out.events.push(LinkEvent::DataReceived {
            name: self.name.clone(),
            data: Bytes::copy_from_slice(data),
        });

        self.decoder.feed(data);
        while let Some(event) = self.decoder.next_event() {
            match event {
                DecodeEvent::Frame(frame) => self.on_frame(now, frame, wheel, out),
                DecodeEvent::Framing(fault) => {
                    self.status.lock().stats.framing_errors += 1;
                    out.events.push(LinkEvent::FramingError {
                        name: self.name.clone(),
                        fault,
                    });
                }
                DecodeEvent::Checksum { code, mode, fault } => {
                    self.status.lock().stats.checksum_errors += 1;
                    debug!(link = %self.name, code, %fault, "checksum error");
                    out.events.push(LinkEvent::ChecksumError {
                        name: self.name.clone(),
                        code,
                        mode,
                        fault,
                    });
                }
                DecodeEvent::Overflow { discarded } => {
                    self.status.lock().stats.overflows += 1;
                    out.events.push(LinkEvent::Overflow {
                        name: self.name.clone(),
                        discarded,
                    });
                }
            }
        }
    }

    fn on_frame(&mut self, now: Instant, frame: Frame, wheel: &mut TimerWheel, out: &mut Outbox) {
        self.status.lock().stats.frames_in += 1;

        if frame.code == Command::Heartbeat.code() {
            self.on_heartbeat(now, frame, wheel, out);
            return;
        }

        if frame.command().is_none() && self.seen_unknown.insert(frame.code) {
            warn!(link = %self.name, code = frame.code, "unknown command code");
            out.events.push(LinkEvent::UnknownCommand {
                name: self.name.clone(),
                code: frame.code,
            });
        }

        if let Err(error) = validate_payload(frame.code, &frame.payload) {
            self.status.lock().stats.protocol_errors += 1;
            debug!(link = %self.name, code = frame.code, %error, "protocol error");
            out.events.push(LinkEvent::ProtocolError {
                name: self.name.clone(),
                frame,
                error,
            });
            return;
        }

        out.frames.push(frame);
    }

    fn on_heartbeat(&mut self, now: Instant, frame: Frame, wheel: &mut TimerWheel, out: &mut Outbox) {
        match Heartbeat::parse(&frame.payload) {
            Ok(ping @ Heartbeat::Ping { .. }) => {
                self.status.lock().stats.heartbeats_received += 1;
                if let Some(pong) = ping.answer() {
                    // Failures are already reported by transmit.
                    let _ = self.write_heartbeat(pong, now, wheel, out);
                }
            }
            Ok(Heartbeat::Pong { .. }) => {
                let rtt = self.heartbeat.on_pong(now);
                let mut s = self.status.lock();
                s.stats.heartbeats_received += 1;
                if let Some(rtt) = rtt {
                    let rtt_ms = rtt.as_secs_f64() * 1000.0;
                    s.stats.last_rtt_ms = Some(rtt_ms);
                    s.stats.avg_latency_ms = self.heartbeat.avg_latency_ms();
                    out.events.push(LinkEvent::HeartbeatRtt {
                        name: self.name.clone(),
                        rtt_ms,
                    });
                }
            }
            Err(error) => {
                self.status.lock().stats.protocol_errors += 1;
                out.events.push(LinkEvent::ProtocolError {
                    name: self.name.clone(),
                    frame,
                    error,
                });
            }
        }
    }

    /// Apply a configuration change, re-applying endpoint settings to an
    /// open transport.
    pub fn apply_update(&mut self, update: ConfigUpdate, now: Instant, wheel: &mut TimerWheel) -> Result<()> {
        update.apply(&mut self.config)?;
        self.status.lock().config = self.config.clone();

        if let Some(option) = update.transport_option() {
            self.transport.set_option(option)?;
        }

        let heartbeat_timer = self.timer(TimerKind::Heartbeat);
        match update {
            ConfigUpdate::Heartbeat(false) => wheel.cancel(heartbeat_timer),
            ConfigUpdate::Heartbeat(true) | ConfigUpdate::HeartbeatInterval(_) => {
                self.heartbeat.set_interval(self.config.heartbeat_interval());
                if self.state == LinkState::Connected && self.config.enable_heartbeat {
                    wheel.schedule(heartbeat_timer, now + self.config.heartbeat_interval());
                }
            }
            _ => {}
        }
        debug!(link = %self.name, ?update, "configuration updated");
        Ok(())
    }

    /// Copy decoder counters into the shared status.
    pub fn publish_parse_stats(&self) {
        self.status.lock().parse = self.decoder.stats().clone();
    }

    pub fn reset_stats(&mut self) {
        self.decoder.reset_stats();
        let mut s = self.status.lock();
        s.stats = Default::default();
        s.parse = Default::default();
    }

    /// Close the endpoint without emitting events (manager shutdown).
    pub fn shutdown(&mut self, wheel: &mut TimerWheel) {
        wheel.cancel_link(self.id);
        self.transport.close();
    }
}
