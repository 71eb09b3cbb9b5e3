//! Hosting a set of named links behind one thread-safe handle.
//!
//! A [`LinkManager`] owns two background threads. The link thread performs
//! every transport read and write and fires every timer; the frame worker
//! drains the [`DispatchQueue`] into the event sink. Caller-facing methods
//! validate, touch the registry briefly, post a request to the link thread
//! and return without doing I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use gluelink_frame::{Frame, FrameError, PoolStats, SharedBufferPool, MAX_PAYLOAD};
use gluelink_transport::{build_transport, Transport, TransportConfig, TransportKind};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigUpdate, LinkConfig, ManagerConfig};
use crate::dispatch::{run_frame_worker, Admission, DispatchQueue, QueueMetrics, WorkItem};
use crate::error::{LinkError, Result};
use crate::event::{ChannelSink, EventSink, LinkEvent};
use crate::link::{Link, Outbox};
use crate::state::{millis, AggregateStats, LinkSnapshot, LinkState, LinkStatus};
use crate::timer::{LinkId, TimerId, TimerWheel};

/// Longest the link thread sleeps when no link is connected.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Shortest per-link read wait when the poll slice is shared.
const MIN_SLICE: Duration = Duration::from_millis(1);

/// Builds the endpoint for a link from its transport configuration.
pub trait TransportFactory: Send + Sync {
    fn build(&self, config: &TransportConfig) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&TransportConfig) -> Box<dyn Transport> + Send + Sync,
{
    fn build(&self, config: &TransportConfig) -> Box<dyn Transport> {
        self(config)
    }
}

/// Real serial ports and TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &TransportConfig) -> Box<dyn Transport> {
        build_transport(config)
    }
}

struct LinkEntry {
    kind: TransportKind,
    priority: i32,
    created_at: Instant,
    seq: u64,
    status: Arc<Mutex<LinkStatus>>,
}

impl LinkEntry {
    fn snapshot(&self, name: &str, now: Instant) -> LinkSnapshot {
        let s = self.status.lock();
        LinkSnapshot {
            name: name.to_string(),
            kind: self.kind,
            endpoint: s.endpoint.clone(),
            state: s.state,
            priority: self.priority,
            retry: s.retry,
            last_error: s.last_error.clone(),
            inactive: s.inactive,
            idle_ms: millis(s.idle(now)),
            uptime_ms: s
                .connected_at
                .filter(|_| s.state == LinkState::Connected)
                .map(|at| millis(now.saturating_duration_since(at))),
            age_ms: millis(now.saturating_duration_since(self.created_at)),
            stats: s.stats.clone(),
            parse: s.parse.clone(),
        }
    }

    fn state(&self) -> LinkState {
        self.status.lock().state
    }
}

/// State visible to both the caller threads and the link thread.
///
/// Lock order: `registry`, then a link's status, then `primary`.
struct Shared {
    config: ManagerConfig,
    registry: Mutex<BTreeMap<String, LinkEntry>>,
    primary: Mutex<Option<String>>,
    queue: Arc<DispatchQueue>,
    pool: SharedBufferPool,
    sink: Arc<dyn EventSink>,
    abort: Arc<AtomicBool>,
}

impl Shared {
    /// Re-elect the primary link; returns the event to publish if it moved.
    fn refresh_primary(&self) -> Option<LinkEvent> {
        let best = {
            let registry = self.registry.lock();
            registry
                .iter()
                .filter(|(_, entry)| entry.state() == LinkState::Connected)
                .min_by_key(|(_, entry)| (entry.priority, entry.seq))
                .map(|(name, _)| name.clone())
        };
        let mut primary = self.primary.lock();
        if *primary == best {
            return None;
        }
        primary.clone_from(&best);
        info!(primary = ?best, "primary link changed");
        Some(LinkEvent::PrimaryChanged { name: best })
    }

    fn aggregate(&self) -> AggregateStats {
        let mut agg = AggregateStats::default();
        for entry in self.registry.lock().values() {
            agg.add(&entry.status.lock());
        }
        agg.queue_depth = self.queue.len();
        agg
    }
}

enum Outbound {
    Raw(Bytes),
    Frame(Frame),
}

enum Request {
    Create {
        name: String,
        id: LinkId,
        kind: TransportKind,
        config: LinkConfig,
        status: Arc<Mutex<LinkStatus>>,
    },
    Remove(String),
    Connect {
        name: String,
        config: Option<LinkConfig>,
    },
    Disconnect(String),
    DisconnectAll,
    ReconnectAll,
    Send {
        name: String,
        outbound: Outbound,
    },
    Update {
        name: String,
        update: ConfigUpdate,
    },
    ResetStats(Option<String>),
    /// Publish an event computed on a caller thread.
    Emit(LinkEvent),
    Shutdown,
}

/// Serializable state of the whole manager.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub primary: Option<String>,
    pub links: Vec<LinkSnapshot>,
    pub aggregate: AggregateStats,
    pub queue: QueueMetrics,
    pub pool: PoolStats,
}

/// Thread-safe handle to a set of named links.
pub struct LinkManager {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    done: Receiver<()>,
    link_thread: Option<JoinHandle<()>>,
    frame_worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("links", &self.names())
            .field("running", &self.link_thread.is_some())
            .finish()
    }
}

impl LinkManager {
    /// Start a manager publishing to `sink`, using real transports.
    pub fn new(config: ManagerConfig, sink: impl EventSink + 'static) -> Result<Self> {
        Self::with_factory(config, sink, DefaultTransportFactory)
    }

    /// Start a manager whose events arrive on the returned channel.
    pub fn channel(config: ManagerConfig) -> Result<(Self, Receiver<LinkEvent>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let manager = Self::new(config, ChannelSink(tx))?;
        Ok((manager, rx))
    }

    /// Start a manager that builds endpoints through `factory`.
    pub fn with_factory(
        config: ManagerConfig,
        sink: impl EventSink + 'static,
        factory: impl TransportFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let abort = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            queue: Arc::new(DispatchQueue::new(
                config.queue_capacity,
                config.max_item_age(),
            )),
            pool: SharedBufferPool::new(config.pool.clone()),
            sink: Arc::new(sink),
            registry: Mutex::new(BTreeMap::new()),
            primary: Mutex::new(None),
            abort: Arc::clone(&abort),
            config,
        });

        let (requests, inbox) = crossbeam_channel::unbounded();
        let (done_tx, done) = crossbeam_channel::bounded(2);

        let worker = LinkThread {
            shared: Arc::clone(&shared),
            factory: Arc::new(factory),
            requests: inbox,
            links: BTreeMap::new(),
            wheel: TimerWheel::new(),
        };
        let link_done = done_tx.clone();
        let link_thread = thread::spawn(move || {
            worker.run();
            let _ = link_done.send(());
        });

        let queue = Arc::clone(&shared.queue);
        let sink = Arc::clone(&shared.sink);
        let frame_worker = thread::spawn(move || {
            run_frame_worker(queue, sink, abort);
            let _ = done_tx.send(());
        });

        info!(
            max_connections = shared.config.max_connections,
            queue_capacity = shared.config.queue_capacity,
            "link manager started"
        );
        Ok(Self {
            shared,
            requests,
            done,
            link_thread: Some(link_thread),
            frame_worker: Some(frame_worker),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    fn post(&self, request: Request) -> Result<()> {
        if self.link_thread.is_none() {
            return Err(LinkError::ShutDown);
        }
        self.requests.send(request).map_err(|_| LinkError::ShutDown)
    }

    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&LinkEntry) -> T) -> Result<T> {
        let registry = self.shared.registry.lock();
        registry
            .get(name)
            .map(f)
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    /// Register a new link. An empty or absent name generates `TYPE_N`
    /// with the smallest free `N`.
    pub fn create(&self, kind: TransportKind, name: Option<&str>) -> Result<String> {
        if self.link_thread.is_none() {
            return Err(LinkError::ShutDown);
        }
        let now = Instant::now();
        let config = LinkConfig::for_kind(kind);
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let status = Arc::new(Mutex::new(LinkStatus::new(
            config.clone(),
            String::new(),
            now,
        )));

        let name = {
            let mut registry = self.shared.registry.lock();
            if registry.len() >= self.shared.config.max_connections {
                return Err(LinkError::TooManyLinks(self.shared.config.max_connections));
            }
            let name = match name.filter(|n| !n.is_empty()) {
                Some(name) if registry.contains_key(name) => {
                    return Err(LinkError::Duplicate(name.to_string()));
                }
                Some(name) => name.to_string(),
                None => {
                    let mut n = 1;
                    loop {
                        let candidate = format!("{}_{n}", kind.name_prefix());
                        if !registry.contains_key(&candidate) {
                            break candidate;
                        }
                        n += 1;
                    }
                }
            };
            registry.insert(
                name.clone(),
                LinkEntry {
                    kind,
                    priority: 0,
                    created_at: now,
                    seq: id.0,
                    status: Arc::clone(&status),
                },
            );
            name
        };

        info!(link = %name, %kind, "link created");
        self.post(Request::Create {
            name: name.clone(),
            id,
            kind,
            config,
            status,
        })?;
        Ok(name)
    }

    /// Disconnect if needed and forget the link.
    pub fn remove(&self, name: &str) -> Result<()> {
        if self.shared.registry.lock().remove(name).is_none() {
            return Err(LinkError::NotFound(name.to_string()));
        }
        info!(link = %name, "link removed");
        self.post(Request::Remove(name.to_string()))
    }

    /// Start connecting, optionally replacing the link's configuration.
    pub fn connect(&self, name: &str, config: Option<LinkConfig>) -> Result<()> {
        let kind = self.with_entry(name, |entry| entry.kind)?;
        if let Some(config) = &config {
            if config.kind() != kind {
                return Err(LinkError::KindMismatch {
                    name: name.to_string(),
                    expected: kind,
                    got: config.kind(),
                });
            }
            config.validate()?;
        }
        self.post(Request::Connect {
            name: name.to_string(),
            config,
        })
    }

    pub fn disconnect(&self, name: &str) -> Result<()> {
        self.with_entry(name, |_| ())?;
        self.post(Request::Disconnect(name.to_string()))
    }

    pub fn disconnect_all(&self) -> Result<()> {
        self.post(Request::DisconnectAll)
    }

    pub fn reconnect_all(&self) -> Result<()> {
        self.post(Request::ReconnectAll)
    }

    fn require_connected(&self, name: &str) -> Result<Arc<Mutex<LinkStatus>>> {
        let status = self.with_entry(name, |entry| Arc::clone(&entry.status))?;
        if status.lock().state != LinkState::Connected {
            return Err(LinkError::NotConnected(name.to_string()));
        }
        Ok(status)
    }

    /// Queue raw bytes for a connected link. Write failures are reported
    /// through events.
    pub fn send(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        self.require_connected(name)?;
        self.post(Request::Send {
            name: name.to_string(),
            outbound: Outbound::Raw(data.into()),
        })
    }

    /// Queue a frame for a connected link, framed with the link's checksum
    /// mode.
    pub fn send_frame(&self, name: &str, code: impl Into<u8>, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            }
            .into());
        }
        let status = self.require_connected(name)?;
        let checksum = status.lock().config.checksum;
        self.post(Request::Send {
            name: name.to_string(),
            outbound: Outbound::Frame(Frame::new(code, payload, checksum)),
        })
    }

    /// Send one frame to every connected link.
    pub fn broadcast(&self, code: impl Into<u8>, payload: impl Into<Bytes>) -> Vec<(String, Result<()>)> {
        let code = code.into();
        let payload = payload.into();
        let connected: Vec<String> = {
            let registry = self.shared.registry.lock();
            registry
                .iter()
                .filter(|(_, entry)| entry.state() == LinkState::Connected)
                .map(|(name, _)| name.clone())
                .collect()
        };
        connected
            .into_iter()
            .map(|name| {
                let result = self.send_frame(&name, code, payload.clone());
                (name, result)
            })
            .collect()
    }

    /// The connected link with the smallest priority value, ties going to
    /// the earliest created.
    pub fn get_primary(&self) -> Option<String> {
        self.shared.primary.lock().clone()
    }

    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        {
            let mut registry = self.shared.registry.lock();
            let entry = registry
                .get_mut(name)
                .ok_or_else(|| LinkError::NotFound(name.to_string()))?;
            entry.priority = priority;
        }
        debug!(link = %name, priority, "priority set");
        if let Some(event) = self.shared.refresh_primary() {
            self.post(Request::Emit(event))?;
        }
        Ok(())
    }

    /// Apply a runtime configuration change. Validated here; applied on
    /// the link thread.
    pub fn update_config(&self, name: &str, update: ConfigUpdate) -> Result<()> {
        let mut config = self.with_entry(name, |entry| entry.status.lock().config.clone())?;
        update.apply(&mut config)?;
        self.post(Request::Update {
            name: name.to_string(),
            update,
        })
    }

    pub fn reset_statistics(&self, name: &str) -> Result<()> {
        self.with_entry(name, |_| ())?;
        self.post(Request::ResetStats(Some(name.to_string())))
    }

    pub fn reset_all_statistics(&self) -> Result<()> {
        self.post(Request::ResetStats(None))
    }

    pub fn names(&self) -> Vec<String> {
        self.shared.registry.lock().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.registry.lock().contains_key(name)
    }

    pub fn state(&self, name: &str) -> Result<LinkState> {
        self.with_entry(name, LinkEntry::state)
    }

    pub fn snapshot(&self, name: &str) -> Result<LinkSnapshot> {
        let now = Instant::now();
        self.with_entry(name, |entry| entry.snapshot(name, now))
    }

    pub fn snapshots(&self) -> Vec<LinkSnapshot> {
        let now = Instant::now();
        let registry = self.shared.registry.lock();
        registry
            .iter()
            .map(|(name, entry)| entry.snapshot(name, now))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    pub fn active_connection_count(&self) -> usize {
        let registry = self.shared.registry.lock();
        registry
            .values()
            .filter(|entry| entry.state() == LinkState::Connected)
            .count()
    }

    /// Link names ordered by priority, then creation.
    pub fn links_by_priority(&self) -> Vec<String> {
        let registry = self.shared.registry.lock();
        let mut ordered: Vec<(&String, &LinkEntry)> = registry.iter().collect();
        ordered.sort_by_key(|(_, entry)| (entry.priority, entry.seq));
        ordered.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.shared.queue.metrics()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        self.shared.aggregate()
    }

    pub fn diagnostic_report(&self) -> DiagnosticReport {
        DiagnosticReport {
            primary: self.get_primary(),
            links: self.snapshots(),
            aggregate: self.aggregate_stats(),
            queue: self.queue_metrics(),
            pool: self.pool_stats(),
        }
    }

    pub fn diagnostic_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.diagnostic_report())?)
    }

    /// Stop both threads, closing every link. Threads that have not
    /// finished within the grace period are told to abort and detached.
    pub fn shutdown(&mut self) {
        let (Some(link_thread), Some(frame_worker)) =
            (self.link_thread.take(), self.frame_worker.take())
        else {
            return;
        };
        let _ = self.requests.send(Request::Shutdown);

        let deadline = Instant::now() + self.shared.config.shutdown_grace();
        let mut finished = 0;
        while finished < 2 && self.done.recv_deadline(deadline).is_ok() {
            finished += 1;
        }
        if finished < 2 {
            warn!("link manager threads still busy after grace period; detaching");
            self.shared.abort.store(true, Ordering::Release);
            self.shared.queue.close();
            return;
        }
        let _ = link_thread.join();
        let _ = frame_worker.join();
        info!("link manager stopped");
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The thread that owns every [`Link`].
struct LinkThread {
    shared: Arc<Shared>,
    factory: Arc<dyn TransportFactory>,
    requests: Receiver<Request>,
    links: BTreeMap<String, Link>,
    wheel: TimerWheel,
}

impl LinkThread {
    fn run(mut self) {
        let now = Instant::now();
        let cfg = &self.shared.config;
        self.wheel
            .schedule(TimerId::Monitoring, now + cfg.monitoring_interval());
        self.wheel
            .schedule(TimerId::HealthCheck, now + cfg.health_check_interval());
        self.wheel
            .schedule(TimerId::Cleanup, now + cfg.cleanup_interval());
        self.wheel
            .schedule(TimerId::PoolCleanup, now + self.shared.pool.cleanup_interval());

        while !self.shared.abort.load(Ordering::Acquire) {
            loop {
                match self.requests.try_recv() {
                    Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => {
                        return self.stop();
                    }
                    Ok(request) => self.handle(request),
                    Err(TryRecvError::Empty) => break,
                }
            }

            self.fire_timers(Instant::now());

            let connected: Vec<String> = self
                .links
                .iter()
                .filter(|(_, link)| link.state() == LinkState::Connected)
                .map(|(name, _)| name.clone())
                .collect();

            if connected.is_empty() {
                let now = Instant::now();
                let wait = self
                    .wheel
                    .next_deadline()
                    .map_or(IDLE_WAIT, |at| at.saturating_duration_since(now))
                    .min(IDLE_WAIT);
                match self.requests.recv_timeout(wait) {
                    Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        return self.stop();
                    }
                    Ok(request) => self.handle(request),
                    Err(RecvTimeoutError::Timeout) => {}
                }
                continue;
            }

            let slice = (self.shared.config.poll_slice() / connected.len() as u32).max(MIN_SLICE);
            for name in connected {
                if let Some(link) = self.links.get_mut(&name) {
                    let mut out = Outbox::default();
                    link.poll(Instant::now(), slice, &self.shared.pool, &mut self.wheel, &mut out);
                    self.flush(&name, out);
                }
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        let names: Vec<String> = self.links.keys().cloned().collect();
        for name in names {
            if let Some(link) = self.links.get_mut(&name) {
                let mut out = Outbox::default();
                link.disconnect(&mut self.wheel, &mut out);
                self.flush(&name, out);
            }
        }
        self.shared.queue.close();
        debug!("link thread stopped");
    }

    fn emit(&self, event: LinkEvent) {
        self.shared.sink.emit(event);
    }

    /// Publish a link step's events and admit its frames to the queue.
    fn flush(&self, name: &str, out: Outbox) {
        let Outbox { events, frames } = out;
        let state_changed = events
            .iter()
            .any(|e| matches!(e, LinkEvent::StateChanged { .. }));
        let primary = if state_changed {
            self.shared.refresh_primary()
        } else {
            None
        };
        for event in events.into_iter().chain(primary) {
            self.emit(event);
        }

        if frames.is_empty() {
            return;
        }
        let priority = self
            .shared
            .registry
            .lock()
            .get(name)
            .map_or(0, |entry| entry.priority);
        let now = Instant::now();
        for frame in frames {
            match self.shared.queue.push(WorkItem::new(name, frame, priority, now)) {
                Admission::Accepted => {}
                Admission::Evicted(victim) => {
                    warn!(link = %victim.link, band = victim.band, "dispatch queue full, evicted oldest");
                    self.emit(LinkEvent::QueueOverflow {
                        name: victim.link,
                        evicted: true,
                    });
                }
                Admission::Rejected(item) => {
                    warn!(link = %item.link, band = item.band, "dispatch queue full, frame dropped");
                    self.emit(LinkEvent::QueueOverflow {
                        name: item.link,
                        evicted: false,
                    });
                }
                Admission::Expired(item) => {
                    debug!(link = %item.link, "stale frame not queued");
                }
            }
        }
    }

    fn with_link(&mut self, name: &str, f: impl FnOnce(&mut Link, &mut TimerWheel, &mut Outbox)) {
        let Some(link) = self.links.get_mut(name) else {
            debug!(link = %name, "request for unknown link ignored");
            return;
        };
        let mut out = Outbox::default();
        f(link, &mut self.wheel, &mut out);
        self.flush(name, out);
    }

    fn handle(&mut self, request: Request) {
        let now = Instant::now();
        match request {
            Request::Create {
                name,
                id,
                kind,
                config,
                status,
            } => {
                let transport = self.factory.build(&config.transport);
                let link = Link::new(name.clone(), id, config, transport, status);
                self.links.insert(name.clone(), link);
                self.emit(LinkEvent::Created { name, kind });
            }
            Request::Remove(name) => {
                if let Some(mut link) = self.links.remove(&name) {
                    let mut out = Outbox::default();
                    link.disconnect(&mut self.wheel, &mut out);
                    self.flush(&name, out);
                }
                self.emit(LinkEvent::Removed { name });
                if let Some(event) = self.shared.refresh_primary() {
                    self.emit(event);
                }
            }
            Request::Connect { name, config } => {
                let factory = Arc::clone(&self.factory);
                self.with_link(&name, |link, wheel, out| match config {
                    Some(config) => {
                        let transport = factory.build(&config.transport);
                        link.connect_with(now, config, transport, wheel, out);
                    }
                    None => link.connect(now, wheel, out),
                });
            }
            Request::Disconnect(name) => {
                self.with_link(&name, |link, wheel, out| link.disconnect(wheel, out));
            }
            Request::DisconnectAll => {
                let names: Vec<String> = self.links.keys().cloned().collect();
                for name in names {
                    self.with_link(&name, |link, wheel, out| link.disconnect(wheel, out));
                }
            }
            Request::ReconnectAll => {
                let names: Vec<String> = self.links.keys().cloned().collect();
                for name in names {
                    self.with_link(&name, |link, wheel, out| link.reconnect(now, wheel, out));
                }
            }
            Request::Send { name, outbound } => {
                self.with_link(&name, |link, wheel, out| {
                    let result = match outbound {
                        Outbound::Raw(data) => link.send(data, now, wheel, out),
                        Outbound::Frame(frame) => link.send_frame(frame, now, wheel, out),
                    };
                    match result {
                        Ok(()) => {}
                        Err(LinkError::NotConnected(name)) => {
                            warn!(link = %name, "send dropped, link no longer connected");
                            out.events.push(LinkEvent::Error {
                                message: format!("link {name} is not connected"),
                                name,
                            });
                        }
                        Err(e) => debug!(link = %link.name(), error = %e, "send failed"),
                    }
                });
            }
            Request::Update { name, update } => {
                self.with_link(&name, |link, wheel, out| {
                    if let Err(e) = link.apply_update(update, now, wheel) {
                        warn!(link = %link.name(), error = %e, "configuration update failed");
                        out.events.push(LinkEvent::Error {
                            name: link.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                });
            }
            Request::ResetStats(Some(name)) => {
                self.with_link(&name, |link, _, _| link.reset_stats());
            }
            Request::ResetStats(None) => {
                for link in self.links.values_mut() {
                    link.reset_stats();
                }
            }
            Request::Emit(event) => self.emit(event),
            Request::Shutdown => {}
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        while let Some(id) = self.wheel.pop_due(now) {
            match id {
                TimerId::Link(link_id, kind) => {
                    let Some(name) = self
                        .links
                        .iter()
                        .find(|(_, link)| link.id() == link_id)
                        .map(|(name, _)| name.clone())
                    else {
                        continue;
                    };
                    self.with_link(&name, |link, wheel, out| link.on_timer(kind, now, wheel, out));
                }
                TimerId::Monitoring => {
                    self.emit(LinkEvent::StatsUpdated(self.shared.aggregate()));
                    let at = now + self.shared.config.monitoring_interval();
                    self.wheel.schedule(TimerId::Monitoring, at);
                }
                TimerId::HealthCheck => {
                    self.health_check(now);
                    let at = now + self.shared.config.health_check_interval();
                    self.wheel.schedule(TimerId::HealthCheck, at);
                }
                TimerId::Cleanup => {
                    self.reap_idle(now);
                    let at = now + self.shared.config.cleanup_interval();
                    self.wheel.schedule(TimerId::Cleanup, at);
                }
                TimerId::PoolCleanup => {
                    for event in self.shared.pool.cleanup_at(now) {
                        warn!(?event, "buffer pool");
                        self.emit(LinkEvent::Pool(event));
                    }
                    let at = now + self.shared.pool.cleanup_interval();
                    self.wheel.schedule(TimerId::PoolCleanup, at);
                }
            }
        }
    }

    /// Flag connected links that have been quiet for more than two
    /// heartbeat intervals. State is left to the link itself.
    fn health_check(&self, now: Instant) {
        let mut events = Vec::new();
        {
            let registry = self.shared.registry.lock();
            for (name, entry) in registry.iter() {
                let mut s = entry.status.lock();
                if s.state != LinkState::Connected || s.inactive {
                    continue;
                }
                let idle = s.idle(now);
                if idle > s.config.heartbeat_interval() * 2 {
                    s.inactive = true;
                    warn!(link = %name, idle_ms = millis(idle), "link inactive");
                    events.push(LinkEvent::LinkInactive {
                        name: name.clone(),
                        idle_ms: millis(idle),
                    });
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Drop disconnected links that have been idle past the reap age.
    fn reap_idle(&mut self, now: Instant) {
        let reap_after = self.shared.config.idle_reap();
        let stale: Vec<String> = {
            let mut registry = self.shared.registry.lock();
            let stale: Vec<String> = registry
                .iter()
                .filter(|(_, entry)| {
                    let s = entry.status.lock();
                    s.state == LinkState::Disconnected && s.idle(now) > reap_after
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in &stale {
                registry.remove(name);
            }
            stale
        };
        for name in stale {
            if let Some(mut link) = self.links.remove(&name) {
                link.shutdown(&mut self.wheel);
            }
            info!(link = %name, "idle link reaped");
            self.emit(LinkEvent::Removed { name });
        }
    }
}
