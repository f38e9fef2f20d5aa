//! Invalidation events.
//!
//! Content and configuration changes are published as events and consumed in
//! batches, so a burst of edits to the same item costs one invalidation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_QUEUE_LEN: &str = "sitecache_event_queue_len";
const METRIC_DROPPED: &str = "sitecache_event_dropped_total";

/// Monotonic, per-process event ordering.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Idempotency key.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A content item was created or updated.
    ContentChanged { id: u64 },
    ContentDeleted { id: u64 },
    /// A taxonomy term was renamed, moved or deleted.
    TermChanged { id: u64 },
    /// Theme, plugin or site-wide settings changed; every page is suspect.
    EnvironmentChanged,
    /// An operator or collaborator asked for one URL to be dropped.
    UrlPurged { url: String },
    PurgeAll,
}

/// Bounded FIFO of pending events. When full, the oldest event is dropped.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::new_with_limit(usize::MAX)
    }

    pub fn new_with_limit(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit
            && let Some(dropped) = queue.pop_front()
        {
            warn!(
                target = "cache::events",
                op = "publish",
                result = "dropped_oldest",
                dropped_id = %dropped.id,
                dropped_kind = ?dropped.kind,
                limit = self.limit,
                "Cache event queue full; dropping oldest event"
            );
            counter!(METRIC_DROPPED).increment(1);
        }
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Remove up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn event_creation() {
        let event = CacheEvent::new(EventKind::PurgeAll, 42);
        assert_eq!(event.epoch, 42);
        assert_eq!(event.kind, EventKind::PurgeAll);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let queue = EventQueue::new();
        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        assert!(e1 < e2);
    }

    #[test]
    fn publish_and_drain_in_order() {
        let queue = EventQueue::new();
        queue.publish(EventKind::ContentChanged { id: 1 });
        queue.publish(EventKind::EnvironmentChanged);
        queue.publish(EventKind::ContentDeleted { id: 2 });
        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(events[0].kind, EventKind::ContentChanged { id: 1 });
        assert_eq!(events[1].kind, EventKind::EnvironmentChanged);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = EventQueue::new();
        queue.publish(EventKind::PurgeAll);
        assert_eq!(queue.drain(100).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = EventQueue::new_with_limit(2);
        queue.publish(EventKind::ContentChanged { id: 1 });
        queue.publish(EventKind::ContentChanged { id: 2 });
        queue.publish(EventKind::ContentChanged { id: 3 });

        let kinds: Vec<_> = queue.drain(10).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ContentChanged { id: 2 },
                EventKind::ContentChanged { id: 3 }
            ]
        );
    }

    #[test]
    fn clear_queue() {
        let queue = EventQueue::new();
        queue.publish(EventKind::PurgeAll);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(EventKind::EnvironmentChanged);
        assert_eq!(queue.len(), 1);
    }
}
