//! Size-classed byte buffer pool.
//!
//! Buffers are checked out with [`BufferPool::acquire`] and handed back
//! with [`BufferPool::release`]. When the aggregate cap is reached the pool
//! falls back to a direct allocation that is simply freed on release.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PoolError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Consecutive over-threshold sweeps before the pool reports itself unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

/// Buffer size buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    Huge,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::Huge,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Smallest class whose limit is at least `size`.
    pub fn for_size(size: usize, limits: &[usize; 4]) -> Option<SizeClass> {
        SizeClass::ALL
            .into_iter()
            .find(|class| size <= limits[class.index()])
    }
}

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Byte caps for Small, Medium, Large and Huge.
    pub size_class_limits: [usize; 4],
    /// Buffers pre-allocated at startup, spread across the classes below Huge.
    pub initial_pool_size: usize,
    /// Aggregate cap on pooled plus checked-out buffers.
    pub max_pool_size: usize,
    pub max_idle_time_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Buffers added to a class on a miss (including the one handed out).
    pub growth_factor: usize,
    /// A class free list above `shrink_threshold * growth_factor` is trimmed
    /// back to `shrink_threshold` on cleanup.
    pub shrink_threshold: usize,
    /// Serialize every pool operation behind a lock. A bare [`BufferPool`]
    /// is single-owner; a [`SharedBufferPool`] needs this set and forces it
    /// on when it is not.
    pub enable_thread_safety: bool,
    pub enable_statistics: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_class_limits: [512, 4 * 1024, 64 * 1024, 1024 * 1024],
            initial_pool_size: 50,
            max_pool_size: 1000,
            max_idle_time_secs: 300,
            cleanup_interval_secs: 60,
            growth_factor: 2,
            shrink_threshold: 10,
            enable_thread_safety: true,
            enable_statistics: true,
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Free-list cap for one class.
    pub fn per_class_cap(&self) -> usize {
        (self.max_pool_size / SizeClass::ALL.len()).max(1)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        let limits = &self.size_class_limits;
        if limits[0] == 0 || limits.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PoolError::InvalidConfig {
                field: "size_class_limits",
                reason: format!("must be non-zero and strictly increasing, got {limits:?}"),
            });
        }
        if self.max_pool_size == 0 {
            return Err(PoolError::InvalidConfig {
                field: "max_pool_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.initial_pool_size > self.max_pool_size {
            return Err(PoolError::InvalidConfig {
                field: "initial_pool_size",
                reason: format!("{} exceeds max_pool_size {}", self.initial_pool_size, self.max_pool_size),
            });
        }
        if self.growth_factor == 0 {
            return Err(PoolError::InvalidConfig {
                field: "growth_factor",
                reason: "must be at least 1".into(),
            });
        }
        if self.cleanup_interval_secs == 0 {
            return Err(PoolError::InvalidConfig {
                field: "cleanup_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// A checked-out buffer.
///
/// Dereferences to its `Vec<u8>`. Hand it back with [`BufferPool::release`];
/// dropping it instead frees the memory but leaves it counted as outstanding.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    id: u64,
    pool_id: u64,
    class: Option<SizeClass>,
    poolable: bool,
}

impl PooledBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` for direct allocations larger than every class.
    pub fn class(&self) -> Option<SizeClass> {
        self.class
    }

    pub fn is_poolable(&self) -> bool {
        self.poolable
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Pool notifications produced by a cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// Occupancy is above 80% of the cap.
    MemoryWarning { occupancy: usize, cap: usize },
    /// The pool stopped (false) or resumed (true) accepting returned buffers.
    HealthChanged { healthy: bool },
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub hits: u64,
    pub misses: u64,
    pub direct_allocations: u64,
    pub evictions: u64,
    pub peak_outstanding: usize,
    pub outstanding: usize,
    pub pooled: usize,
    pub bytes_held: usize,
    pub healthy: bool,
}

impl PoolStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    id: u64,
    returned_at: Instant,
}

/// A size-classed buffer pool. See the module docs.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    config: PoolConfig,
    free: [VecDeque<Slot>; 4],
    outstanding: HashSet<u64>,
    direct_outstanding: usize,
    next_buffer_id: u64,
    stats: PoolStats,
    warning_streak: u32,
    healthy: bool,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl BufferPool {
    /// Create a pool and pre-allocate its initial buffers.
    pub fn new(config: PoolConfig) -> Self {
        let mut pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            free: Default::default(),
            outstanding: HashSet::new(),
            direct_outstanding: 0,
            next_buffer_id: 1,
            stats: PoolStats {
                healthy: true,
                ..PoolStats::default()
            },
            warning_streak: 0,
            healthy: true,
        };
        pool.preallocate();
        pool
    }

    fn preallocate(&mut self) {
        let per_class = self.config.initial_pool_size / SizeClass::ALL.len();
        let now = Instant::now();
        // Huge buffers are only allocated on demand.
        for class in [SizeClass::Small, SizeClass::Medium, SizeClass::Large] {
            for _ in 0..per_class.min(self.config.per_class_cap()) {
                let slot = self.fresh_slot(class, now);
                self.free[class.index()].push_back(slot);
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Pooled plus checked-out poolable buffers.
    pub fn occupancy(&self) -> usize {
        self.pooled() + self.outstanding.len()
    }

    /// Buffers sitting in the free lists.
    pub fn pooled(&self) -> usize {
        self.free.iter().map(VecDeque::len).sum()
    }

    /// Buffers checked out and not yet released, direct allocations included.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len() + self.direct_outstanding
    }

    fn class_limit(&self, class: SizeClass) -> usize {
        self.config.size_class_limits[class.index()]
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        id
    }

    fn fresh_slot(&mut self, class: SizeClass, now: Instant) -> Slot {
        Slot {
            data: Vec::with_capacity(self.class_limit(class)),
            id: self.next_id(),
            returned_at: now,
        }
    }

    /// Check out a buffer with capacity for at least `size` bytes.
    ///
    /// Never blocks: at the cap it allocates a buffer outside the pool.
    pub fn acquire(&mut self, size: usize) -> PooledBuffer {
        self.stats.acquisitions += 1;

        let Some(class) = SizeClass::for_size(size, &self.config.size_class_limits) else {
            return self.direct(size, None);
        };

        if let Some(mut slot) = self.free[class.index()].pop_back() {
            slot.data.clear();
            if self.config.enable_statistics {
                self.stats.hits += 1;
            }
            return self.check_out(slot.data, slot.id, class);
        }

        if self.config.enable_statistics {
            self.stats.misses += 1;
        }
        if self.occupancy() >= self.config.max_pool_size {
            debug!(size, ?class, "pool at capacity, allocating directly");
            return self.direct(size, Some(class));
        }

        let slot = self.fresh_slot(class, Instant::now());
        let buffer = self.check_out(slot.data, slot.id, class);

        if class != SizeClass::Huge {
            let now = Instant::now();
            for _ in 1..self.config.growth_factor {
                if self.occupancy() >= self.config.max_pool_size
                    || self.free[class.index()].len() >= self.config.per_class_cap()
                {
                    break;
                }
                let extra = self.fresh_slot(class, now);
                self.free[class.index()].push_back(extra);
            }
        }
        buffer
    }

    fn check_out(&mut self, data: Vec<u8>, id: u64, class: SizeClass) -> PooledBuffer {
        self.outstanding.insert(id);
        self.note_peak();
        PooledBuffer {
            data,
            id,
            pool_id: self.id,
            class: Some(class),
            poolable: true,
        }
    }

    fn direct(&mut self, size: usize, class: Option<SizeClass>) -> PooledBuffer {
        let capacity = class.map_or(size, |c| self.class_limit(c));
        let id = self.next_id();
        self.direct_outstanding += 1;
        if self.config.enable_statistics {
            self.stats.direct_allocations += 1;
        }
        self.note_peak();
        PooledBuffer {
            data: Vec::with_capacity(capacity),
            id,
            pool_id: self.id,
            class,
            poolable: false,
        }
    }

    fn note_peak(&mut self) {
        if self.config.enable_statistics {
            self.stats.peak_outstanding = self.stats.peak_outstanding.max(self.outstanding());
        }
    }

    /// Return a buffer. Its length is reset; its capacity is kept.
    pub fn release(&mut self, mut buffer: PooledBuffer) -> Result<(), PoolError> {
        if buffer.pool_id != self.id {
            return Err(PoolError::ForeignBuffer {
                buffer: buffer.id,
                owner: buffer.pool_id,
                pool: self.id,
            });
        }

        let class = match (buffer.poolable, buffer.class) {
            (true, Some(class)) => class,
            _ => {
                self.direct_outstanding = self.direct_outstanding.saturating_sub(1);
                self.stats.releases += 1;
                return Ok(());
            }
        };

        if !self.outstanding.remove(&buffer.id) {
            return Err(PoolError::NotOutstanding(buffer.id));
        }
        self.stats.releases += 1;

        let list = &mut self.free[class.index()];
        if self.healthy && list.len() < self.config.per_class_cap() {
            buffer.data.clear();
            list.push_back(Slot {
                data: std::mem::take(&mut buffer.data),
                id: buffer.id,
                returned_at: Instant::now(),
            });
        } else if self.config.enable_statistics {
            self.stats.evictions += 1;
        }
        Ok(())
    }

    /// Evict idle buffers and re-evaluate the memory warning line.
    pub fn cleanup(&mut self) -> Vec<PoolEvent> {
        self.cleanup_at(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock.
    pub fn cleanup_at(&mut self, now: Instant) -> Vec<PoolEvent> {
        let max_idle = self.config.max_idle_time();
        let shrink_above = self
            .config
            .shrink_threshold
            .saturating_mul(self.config.growth_factor);
        let mut evicted = 0u64;

        for list in &mut self.free {
            // Oldest returns sit at the front.
            while list
                .front()
                .is_some_and(|slot| now.saturating_duration_since(slot.returned_at) > max_idle)
            {
                list.pop_front();
                evicted += 1;
            }
            if list.len() > shrink_above {
                let surplus = list.len() - self.config.shrink_threshold;
                list.drain(..surplus);
                evicted += surplus as u64;
            }
        }

        self.after_sweep(evicted)
    }

    /// Free every pooled buffer regardless of idle time.
    pub fn force_cleanup(&mut self) -> Vec<PoolEvent> {
        let evicted = self.pooled() as u64;
        for list in &mut self.free {
            list.clear();
        }
        self.after_sweep(evicted)
    }

    fn after_sweep(&mut self, evicted: u64) -> Vec<PoolEvent> {
        if self.config.enable_statistics {
            self.stats.evictions += evicted;
        }
        if evicted > 0 {
            debug!(evicted, pooled = self.pooled(), "pool sweep");
        }

        let mut events = Vec::new();
        let occupancy = self.occupancy();
        let cap = self.config.max_pool_size;
        if occupancy * 10 > cap * 8 {
            warn!(occupancy, cap, "buffer pool above warning line");
            events.push(PoolEvent::MemoryWarning { occupancy, cap });
            self.warning_streak += 1;
            if self.warning_streak >= UNHEALTHY_AFTER && self.healthy {
                self.healthy = false;
                warn!("buffer pool marked unhealthy");
                events.push(PoolEvent::HealthChanged { healthy: false });
            }
        } else {
            self.warning_streak = 0;
            if !self.healthy {
                self.healthy = true;
                events.push(PoolEvent::HealthChanged { healthy: true });
            }
        }
        events
    }

    /// Drop every pooled buffer and forget outstanding ones.
    ///
    /// Buffers checked out before the clear are rejected by `release`.
    pub fn clear(&mut self) {
        for list in &mut self.free {
            list.clear();
        }
        self.outstanding.clear();
        self.direct_outstanding = 0;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding(),
            pooled: self.pooled(),
            bytes_held: self
                .free
                .iter()
                .flatten()
                .map(|slot| slot.data.capacity())
                .sum(),
            healthy: self.healthy,
            ..self.stats.clone()
        }
    }
}

/// A cloneable, internally locked handle to a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct SharedBufferPool {
    inner: Arc<Mutex<BufferPool>>,
}

impl Default for SharedBufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl SharedBufferPool {
    pub fn new(mut config: PoolConfig) -> Self {
        if !config.enable_thread_safety {
            warn!("shared buffer pool always locks, enabling thread safety");
            config.enable_thread_safety = true;
        }
        Self {
            inner: Arc::new(Mutex::new(BufferPool::new(config))),
        }
    }

    /// The effective settings.
    pub fn config(&self) -> PoolConfig {
        self.inner.lock().config().clone()
    }

    pub fn acquire(&self, size: usize) -> PooledBuffer {
        self.inner.lock().acquire(size)
    }

    pub fn release(&self, buffer: PooledBuffer) -> Result<(), PoolError> {
        self.inner.lock().release(buffer)
    }

    pub fn cleanup_at(&self, now: Instant) -> Vec<PoolEvent> {
        self.inner.lock().cleanup_at(now)
    }

    pub fn force_cleanup(&self) -> Vec<PoolEvent> {
        self.inner.lock().force_cleanup()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.lock().is_healthy()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.inner.lock().config().cleanup_interval()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max: usize) -> BufferPool {
        BufferPool::new(PoolConfig {
            initial_pool_size: 0,
            max_pool_size: max,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn picks_smallest_fitting_class() {
        let limits = PoolConfig::default().size_class_limits;
        assert_eq!(SizeClass::for_size(0, &limits), Some(SizeClass::Small));
        assert_eq!(SizeClass::for_size(512, &limits), Some(SizeClass::Small));
        assert_eq!(SizeClass::for_size(513, &limits), Some(SizeClass::Medium));
        assert_eq!(SizeClass::for_size(70_000, &limits), Some(SizeClass::Huge));
        assert_eq!(SizeClass::for_size(2 * 1024 * 1024, &limits), None);
    }

    #[test]
    fn preallocates_below_huge() {
        let pool = BufferPool::default();
        assert_eq!(pool.pooled(), 36);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn released_buffer_is_reused_with_zero_length() {
        let mut pool = small_pool(100);
        let mut buf = pool.acquire(100);
        buf.extend_from_slice(b"hello");
        let id = buf.id();
        let cap = buf.capacity();
        pool.release(buf).unwrap();

        let again = pool.acquire(10);
        assert!(again.is_empty());
        assert!(again.capacity() >= cap.min(512));
        // growth_factor 2 adds one spare; the released buffer comes back first.
        assert_eq!(again.id(), id);
        assert!(pool.stats().hits >= 1);
    }

    #[test]
    fn cap_falls_back_to_direct_allocation() {
        let mut pool = BufferPool::new(PoolConfig {
            initial_pool_size: 0,
            max_pool_size: 2,
            growth_factor: 1,
            ..PoolConfig::default()
        });
        let a = pool.acquire(10);
        let b = pool.acquire(10);
        let c = pool.acquire(10);
        assert!(a.is_poolable() && b.is_poolable());
        assert!(!c.is_poolable());
        assert_eq!(pool.occupancy(), 2);
        assert_eq!(pool.outstanding(), 3);
        pool.release(c).unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.stats().direct_allocations, 1);
    }

    #[test]
    fn oversized_request_is_direct() {
        let mut pool = small_pool(10);
        let buf = pool.acquire(2 * 1024 * 1024);
        assert_eq!(buf.class(), None);
        assert!(buf.capacity() >= 2 * 1024 * 1024);
        pool.release(buf).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn foreign_release_is_rejected() {
        let mut a = small_pool(10);
        let mut b = small_pool(10);
        let buf = a.acquire(1);
        let err = b.release(buf).unwrap_err();
        assert!(matches!(err, PoolError::ForeignBuffer { .. }));
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn release_after_clear_is_rejected() {
        let mut pool = small_pool(10);
        let buf = pool.acquire(1);
        let id = buf.id();
        pool.clear();
        assert_eq!(pool.release(buf), Err(PoolError::NotOutstanding(id)));
        // The pool still works.
        let next = pool.acquire(1);
        pool.release(next).unwrap();
    }

    #[test]
    fn acquired_minus_released_is_outstanding() {
        let mut pool = small_pool(8);
        let mut held = Vec::new();
        for i in 0..20 {
            held.push(pool.acquire(i * 300));
        }
        for _ in 0..7 {
            pool.release(held.pop().unwrap()).unwrap();
        }
        let stats = pool.stats();
        assert_eq!(
            (stats.acquisitions - stats.releases) as usize,
            stats.outstanding
        );
        assert_eq!(stats.outstanding, 13);
    }

    #[test]
    fn idle_buffers_are_evicted() {
        let mut pool = small_pool(100);
        let buf = pool.acquire(1);
        pool.release(buf).unwrap();
        assert!(pool.pooled() > 0);
        assert!(pool.cleanup_at(Instant::now()).is_empty());
        assert!(pool.pooled() > 0);

        pool.cleanup_at(Instant::now() + Duration::from_secs(301));
        assert_eq!(pool.pooled(), 0);
        assert!(pool.stats().evictions > 0);
    }

    #[test]
    fn sustained_pressure_marks_pool_unhealthy() {
        let mut pool = BufferPool::new(PoolConfig {
            initial_pool_size: 0,
            max_pool_size: 10,
            growth_factor: 1,
            ..PoolConfig::default()
        });
        let held: Vec<_> = (0..9).map(|_| pool.acquire(1)).collect();

        let first = pool.cleanup();
        assert_eq!(first, vec![PoolEvent::MemoryWarning { occupancy: 9, cap: 10 }]);
        pool.cleanup();
        let third = pool.cleanup();
        assert!(third.contains(&PoolEvent::HealthChanged { healthy: false }));
        assert!(!pool.is_healthy());

        // Unhealthy pools free returned buffers instead of keeping them.
        for buf in held {
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.pooled(), 0);
        let recovered = pool.cleanup();
        assert_eq!(recovered, vec![PoolEvent::HealthChanged { healthy: true }]);
    }

    #[test]
    fn force_cleanup_empties_free_lists() {
        let mut pool = BufferPool::default();
        assert!(pool.pooled() > 0);
        pool.force_cleanup();
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.stats().bytes_held, 0);
    }

    #[test]
    fn statistics_can_be_disabled() {
        let mut pool = BufferPool::new(PoolConfig {
            enable_statistics: false,
            ..PoolConfig::default()
        });
        let buf = pool.acquire(1);
        pool.release(buf).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(stats.acquisitions, 1);
    }

    #[test]
    fn config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        let bad = PoolConfig {
            size_class_limits: [512, 256, 65536, 1024],
            ..PoolConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(PoolError::InvalidConfig { field: "size_class_limits", .. })
        ));
    }

    #[test]
    fn shared_pool_forces_thread_safety() {
        let pool = SharedBufferPool::new(PoolConfig {
            enable_thread_safety: false,
            ..PoolConfig::default()
        });
        assert!(pool.config().enable_thread_safety);
        assert!(SharedBufferPool::default().config().enable_thread_safety);
    }

    #[test]
    fn shared_pool_across_threads() {
        let pool = SharedBufferPool::default();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.acquire(64);
                        pool.release(buf).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 400);
        assert_eq!(stats.outstanding, 0);
    }
}
