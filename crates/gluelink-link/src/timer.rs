//! A single timer queue for every link and manager task.
//!
//! Rescheduling a timer supersedes its previous deadline; cancelled and
//! superseded entries are skipped lazily when they reach the front.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use serde::Serialize;

/// Identifies a link for the lifetime of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u64);

/// The per-link timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Heartbeat,
    Reconnect,
    ConnectTimeout,
    Statistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    Link(LinkId, TimerKind),
    Monitoring,
    HealthCheck,
    Cleanup,
    PoolCleanup,
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
    live: HashMap<TimerId, u64>,
    next_generation: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` to fire at `at`, replacing any pending deadline.
    pub fn schedule(&mut self, id: TimerId, at: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(id, generation);
        self.heap.push(Reverse((at, generation, id)));
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    /// Cancel every timer belonging to one link.
    pub fn cancel_link(&mut self, link: LinkId) {
        self.live
            .retain(|id, _| !matches!(id, TimerId::Link(owner, _) if *owner == link));
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.live.contains_key(&id)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Pop one timer whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerId> {
        self.discard_stale();
        let Reverse((at, _, _)) = self.heap.peek()?;
        if *at > now {
            return None;
        }
        let Reverse((_, _, id)) = self.heap.pop()?;
        self.live.remove(&id);
        Some(id)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.heap.peek() {
            if self.live.get(id) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(TimerId::Cleanup, t0 + Duration::from_secs(3));
        wheel.schedule(TimerId::Monitoring, t0 + Duration::from_secs(1));
        wheel.schedule(TimerId::HealthCheck, t0 + Duration::from_secs(2));

        assert_eq!(wheel.pop_due(t0), None);
        let later = t0 + Duration::from_secs(5);
        assert_eq!(wheel.pop_due(later), Some(TimerId::Monitoring));
        assert_eq!(wheel.pop_due(later), Some(TimerId::HealthCheck));
        assert_eq!(wheel.pop_due(later), Some(TimerId::Cleanup));
        assert_eq!(wheel.pop_due(later), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn reschedule_supersedes() {
        let t0 = Instant::now();
        let id = TimerId::Link(LinkId(1), TimerKind::Heartbeat);
        let mut wheel = TimerWheel::new();
        wheel.schedule(id, t0 + Duration::from_secs(1));
        wheel.schedule(id, t0 + Duration::from_secs(10));
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_secs(10)));
        assert_eq!(wheel.pop_due(t0 + Duration::from_secs(2)), None);
        assert_eq!(wheel.pop_due(t0 + Duration::from_secs(10)), Some(id));
    }

    #[test]
    fn cancel_link_leaves_others() {
        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(TimerId::Link(LinkId(1), TimerKind::Heartbeat), t0);
        wheel.schedule(TimerId::Link(LinkId(1), TimerKind::Statistics), t0);
        wheel.schedule(TimerId::Link(LinkId(2), TimerKind::Heartbeat), t0);
        wheel.cancel_link(LinkId(1));
        assert_eq!(wheel.len(), 1);
        assert_eq!(
            wheel.pop_due(t0),
            Some(TimerId::Link(LinkId(2), TimerKind::Heartbeat))
        );
        assert_eq!(wheel.next_deadline(), None);
    }
}
