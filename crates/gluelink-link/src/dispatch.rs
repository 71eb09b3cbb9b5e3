//! Bounded priority queue between the link thread and the frame worker.
//!
//! Producers never block: when the queue is full, the oldest item of the
//! same or lower priority is evicted to make room, and if there is none the
//! new item is refused.
//!
//! A work item's band is its link's priority, so frames from one link share
//! a band and leave the queue in the order they arrived.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gluelink_frame::Frame;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, trace};

use crate::event::{EventSink, LinkEvent};
use crate::state::millis;

/// Number of dispatch priority bands (0 is the most urgent).
pub const PRIORITY_BANDS: usize = 4;

/// Wait samples kept for the p95 estimate.
const WAIT_SAMPLES: usize = 256;
/// Window over which evictions per second are measured.
const EVICTION_WINDOW: Duration = Duration::from_secs(1);

/// A decoded frame waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub link: String,
    pub frame: Frame,
    /// 0 is the most urgent.
    pub band: u8,
    pub enqueued_at: Instant,
}

impl WorkItem {
    /// Band taken from the owning link's priority.
    pub fn new(link: impl Into<String>, frame: Frame, priority: i32, now: Instant) -> Self {
        Self::with_band(link, frame, band_for_priority(priority), now)
    }

    pub fn with_band(link: impl Into<String>, frame: Frame, band: u8, now: Instant) -> Self {
        Self {
            link: link.into(),
            frame,
            band: band.min(PRIORITY_BANDS as u8 - 1),
            enqueued_at: now,
        }
    }
}

/// Link priorities at or below zero share the most urgent band; anything
/// past the last band is clamped into it.
pub fn band_for_priority(priority: i32) -> u8 {
    priority.clamp(0, PRIORITY_BANDS as i32 - 1) as u8
}

/// Outcome of [`DispatchQueue::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    /// Accepted after evicting this older item.
    Evicted(WorkItem),
    /// The queue was full of more urgent work; the new item was dropped.
    Rejected(WorkItem),
    /// Older than the maximum age on arrival; dropped without queueing.
    Expired(WorkItem),
}

/// Queue counters and latency figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub depth: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub dispatched: u64,
    pub evicted: u64,
    pub rejected: u64,
    /// Discarded at admission or dequeue for exceeding the maximum age.
    pub expired: u64,
    pub peak_depth: usize,
    pub p95_wait_ms: u64,
    pub evictions_per_sec: f64,
}

#[derive(Debug)]
struct Inner {
    bands: [VecDeque<WorkItem>; PRIORITY_BANDS],
    len: usize,
    closed: bool,
    waits: VecDeque<Duration>,
    recent_evictions: VecDeque<Instant>,
    metrics: QueueMetrics,
}

impl Inner {
    fn note_eviction(&mut self, now: Instant) {
        self.recent_evictions.push_back(now);
        self.trim_evictions(now);
    }

    fn trim_evictions(&mut self, now: Instant) {
        while self
            .recent_evictions
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > EVICTION_WINDOW)
        {
            self.recent_evictions.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
    max_age: Duration,
}

impl DispatchQueue {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bands: Default::default(),
                len: 0,
                closed: false,
                waits: VecDeque::with_capacity(WAIT_SAMPLES),
                recent_evictions: VecDeque::new(),
                metrics: QueueMetrics {
                    capacity,
                    ..QueueMetrics::default()
                },
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            max_age,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit an item. Never blocks. Items already past the maximum age are
    /// refused.
    pub fn push(&self, item: WorkItem) -> Admission {
        let mut inner = self.inner.lock();
        inner.metrics.pushed += 1;

        let age = Instant::now().saturating_duration_since(item.enqueued_at);
        if age > self.max_age {
            inner.metrics.expired += 1;
            trace!(link = %item.link, age_ms = millis(age), "work item expired on admission");
            return Admission::Expired(item);
        }

        let mut admission = Admission::Accepted;
        if inner.len >= self.capacity {
            // Oldest item in the least urgent band at or below the newcomer's.
            let victim_band = (item.band as usize..PRIORITY_BANDS)
                .rev()
                .find(|&b| !inner.bands[b].is_empty());
            match victim_band.and_then(|b| inner.bands[b].pop_front()) {
                Some(victim) => {
                    inner.len -= 1;
                    inner.metrics.evicted += 1;
                    inner.note_eviction(item.enqueued_at);
                    debug!(link = %victim.link, code = victim.frame.code, "dispatch queue full, evicting");
                    admission = Admission::Evicted(victim);
                }
                None => {
                    inner.metrics.rejected += 1;
                    debug!(link = %item.link, code = item.frame.code, "dispatch queue full, dropping");
                    return Admission::Rejected(item);
                }
            }
        }

        let band = item.band as usize;
        inner.bands[band].push_back(item);
        inner.len += 1;
        inner.metrics.peak_depth = inner.metrics.peak_depth.max(inner.len);
        drop(inner);
        self.ready.notify_one();
        admission
    }

    /// Take the most urgent item, waiting up to `timeout`.
    ///
    /// Items older than the maximum age are discarded on the way. Returns
    /// `None` on timeout or once the queue is closed and empty.
    pub fn pop(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            while let Some(item) = Self::take_next(&mut inner) {
                let now = Instant::now();
                let waited = now.saturating_duration_since(item.enqueued_at);
                if waited > self.max_age {
                    inner.metrics.expired += 1;
                    trace!(link = %item.link, waited_ms = millis(waited), "work item expired");
                    continue;
                }
                if inner.waits.len() == WAIT_SAMPLES {
                    inner.waits.pop_front();
                }
                inner.waits.push_back(waited);
                inner.metrics.dispatched += 1;
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    fn take_next(inner: &mut Inner) -> Option<WorkItem> {
        let item = inner.bands.iter_mut().find_map(VecDeque::pop_front)?;
        inner.len -= 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting waits; `pop` drains what is left, then returns `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn metrics(&self) -> QueueMetrics {
        let mut inner = self.inner.lock();
        inner.trim_evictions(Instant::now());
        let mut waits: Vec<Duration> = inner.waits.iter().copied().collect();
        waits.sort_unstable();
        let p95 = if waits.is_empty() {
            Duration::ZERO
        } else {
            waits[(waits.len() * 95).div_ceil(100).saturating_sub(1)]
        };
        QueueMetrics {
            depth: inner.len,
            capacity: self.capacity,
            p95_wait_ms: millis(p95),
            evictions_per_sec: inner.recent_evictions.len() as f64 / EVICTION_WINDOW.as_secs_f64(),
            ..inner.metrics.clone()
        }
    }
}

/// Drains the queue and publishes each frame as [`LinkEvent::FrameReceived`].
///
/// Returns when the queue is closed and empty, or as soon as `abort` is set.
pub fn run_frame_worker(queue: Arc<DispatchQueue>, sink: Arc<dyn EventSink>, abort: Arc<AtomicBool>) {
    debug!("frame worker started");
    while !abort.load(Ordering::Acquire) {
        match queue.pop(Duration::from_millis(100)) {
            Some(item) => sink.emit(LinkEvent::FrameReceived {
                name: item.link,
                frame: item.frame,
            }),
            None if queue.is_closed() && queue.is_empty() => break,
            None => {}
        }
    }
    debug!("frame worker stopped");
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use gluelink_frame::ChecksumMode;

    use super::*;

    fn item(seq: u8, band: u8, now: Instant) -> WorkItem {
        WorkItem::with_band(
            "TCP_1",
            Frame::new(0x04u8, Bytes::copy_from_slice(&[seq]), ChecksumMode::Additive),
            band,
            now,
        )
    }

    #[test]
    fn overload_evicts_oldest_and_keeps_order() {
        let now = Instant::now();
        let queue = DispatchQueue::new(10, Duration::from_secs(30));
        let mut overflows = 0;
        for seq in 0..15u8 {
            match queue.push(item(seq, 1, now)) {
                Admission::Accepted => {}
                Admission::Evicted(_) | Admission::Rejected(_) => overflows += 1,
                Admission::Expired(_) => unreachable!("fresh item expired on admission"),
            }
            assert!(queue.len() <= 10);
        }
        assert_eq!(overflows, 5);

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop(Duration::ZERO))
            .map(|w| w.frame.payload[0])
            .collect();
        assert_eq!(order, (5..15).collect::<Vec<u8>>());
        let m = queue.metrics();
        assert_eq!(m.evicted, 5);
        assert_eq!(m.dispatched, 10);
        assert_eq!(m.peak_depth, 10);
    }

    #[test]
    fn urgent_work_is_never_evicted_for_less_urgent() {
        let now = Instant::now();
        let queue = DispatchQueue::new(2, Duration::from_secs(30));
        queue.push(item(1, 0, now));
        queue.push(item(2, 0, now));
        match queue.push(item(3, 2, now)) {
            Admission::Rejected(rejected) => assert_eq!(rejected.frame.payload[0], 3),
            other => panic!("expected rejection, got {other:?}"),
        }
        // An urgent newcomer displaces the least urgent item.
        let queue = DispatchQueue::new(2, Duration::from_secs(30));
        queue.push(item(1, 3, now));
        queue.push(item(2, 1, now));
        match queue.push(item(3, 0, now)) {
            Admission::Evicted(victim) => assert_eq!(victim.frame.payload[0], 1),
            other => panic!("expected eviction, got {other:?}"),
        }
    }

    #[test]
    fn priority_then_fifo() {
        let now = Instant::now();
        let queue = DispatchQueue::new(10, Duration::from_secs(30));
        queue.push(item(1, 2, now));
        queue.push(item(2, 0, now));
        queue.push(item(3, 2, now));
        queue.push(item(4, 1, now));
        let order: Vec<u8> = std::iter::from_fn(|| queue.pop(Duration::ZERO))
            .map(|w| w.frame.payload[0])
            .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn stale_items_are_discarded() {
        let queue = DispatchQueue::new(10, Duration::from_millis(300));
        let soon_stale = Instant::now() - Duration::from_millis(200);
        assert_eq!(queue.push(item(1, 1, soon_stale)), Admission::Accepted);
        assert_eq!(queue.push(item(2, 1, Instant::now())), Admission::Accepted);
        std::thread::sleep(Duration::from_millis(150));
        let got = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(got.frame.payload[0], 2);
        assert_eq!(queue.metrics().expired, 1);
    }

    #[test]
    fn items_past_max_age_are_refused_on_admission() {
        let queue = DispatchQueue::new(10, Duration::from_secs(30));
        let old = Instant::now() - Duration::from_secs(31);
        match queue.push(item(1, 1, old)) {
            Admission::Expired(refused) => assert_eq!(refused.frame.payload[0], 1),
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(queue.is_empty());
        let m = queue.metrics();
        assert_eq!(m.pushed, 1);
        assert_eq!(m.expired, 1);
        assert_eq!(m.evicted + m.rejected, 0);
    }

    #[test]
    fn one_link_keeps_arrival_order_across_commands() {
        let now = Instant::now();
        let queue = DispatchQueue::new(10, Duration::from_secs(30));
        // Motion query, then device status: different command families.
        for code in [0x18u8, 0x04, 0x08, 0x21] {
            let frame = Frame::new(code, Bytes::new(), ChecksumMode::Crc16Modbus);
            assert_eq!(queue.push(WorkItem::new("TCP_1", frame, 2, now)), Admission::Accepted);
        }
        let order: Vec<u8> = std::iter::from_fn(|| queue.pop(Duration::ZERO))
            .map(|w| w.frame.code)
            .collect();
        assert_eq!(order, vec![0x18, 0x04, 0x08, 0x21]);
    }

    #[test]
    fn link_priority_selects_band() {
        assert_eq!(band_for_priority(-5), 0);
        assert_eq!(band_for_priority(0), 0);
        assert_eq!(band_for_priority(2), 2);
        assert_eq!(band_for_priority(99), PRIORITY_BANDS as u8 - 1);

        let now = Instant::now();
        let queue = DispatchQueue::new(10, Duration::from_secs(30));
        let frame = |code: u8| Frame::new(code, Bytes::new(), ChecksumMode::Additive);
        queue.push(WorkItem::new("SERIAL_1", frame(0x08), 3, now));
        queue.push(WorkItem::new("TCP_1", frame(0x21), 0, now));
        let first = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(first.link, "TCP_1");
        assert_eq!(first.band, 0);
    }

    #[test]
    fn closed_queue_drains_then_stops() {
        let queue = DispatchQueue::new(4, Duration::from_secs(30));
        queue.push(item(1, 1, Instant::now()));
        queue.close();
        assert!(queue.pop(Duration::from_secs(1)).is_some());
        assert!(queue.pop(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn worker_publishes_frames() {
        let queue = Arc::new(DispatchQueue::new(4, Duration::from_secs(30)));
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink: Arc<dyn EventSink> = Arc::new(crate::event::ChannelSink(tx));
        let abort = Arc::new(AtomicBool::new(false));
        queue.push(item(7, 1, Instant::now()));
        queue.close();
        run_frame_worker(Arc::clone(&queue), sink, abort);
        match rx.try_recv().unwrap() {
            LinkEvent::FrameReceived { name, frame } => {
                assert_eq!(name, "TCP_1");
                assert_eq!(frame.payload[0], 7);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
