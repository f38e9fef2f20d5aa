//! Invalidation entry points for collaborators.
//!
//! Publishers call these after a successful write; with
//! `consume_immediately` the consumer runs in the same call.

use std::sync::Arc;

use super::consumer::{CacheConsumer, ConsumeReport};
use super::engine::PageCacheEngine;
use super::events::{EventKind, EventQueue};

pub struct CacheTrigger {
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
    consume_now: bool,
}

impl CacheTrigger {
    pub fn new(queue: Arc<EventQueue>, consumer: Arc<CacheConsumer>, consume_now: bool) -> Self {
        Self {
            queue,
            consumer,
            consume_now,
        }
    }

    /// Wire a queue and consumer from the engine's configuration.
    ///
    /// The queue holds at most `event_queue_limit` events and
    /// `consume_immediately` selects between inline and deferred consumption.
    pub fn from_engine(engine: Arc<PageCacheEngine>) -> Self {
        let consume_now = engine.config().consume_immediately;
        let queue = Arc::new(EventQueue::new_with_limit(
            engine.config().event_queue_limit_non_zero(),
        ));
        let consumer = Arc::new(CacheConsumer::new(engine, Arc::clone(&queue)));
        Self::new(queue, consumer, consume_now)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Publish an event and, if configured, consume the queue right away.
    pub fn trigger(&self, kind: EventKind) -> Option<ConsumeReport> {
        self.queue.publish(kind);
        self.consume_now.then(|| self.consumer.consume_all())
    }

    pub fn on_content_changed(&self, id: u64) -> Option<ConsumeReport> {
        self.trigger(EventKind::ContentChanged { id })
    }

    pub fn on_content_deleted(&self, id: u64) -> Option<ConsumeReport> {
        self.trigger(EventKind::ContentDeleted { id })
    }

    pub fn on_term_changed(&self, id: u64) -> Option<ConsumeReport> {
        self.trigger(EventKind::TermChanged { id })
    }

    pub fn on_environment_changed(&self) -> Option<ConsumeReport> {
        self.trigger(EventKind::EnvironmentChanged)
    }

    pub fn purge_url(&self, url: &str) -> Option<ConsumeReport> {
        self.trigger(EventKind::UrlPurged {
            url: url.to_string(),
        })
    }

    pub fn purge_all(&self) -> Option<ConsumeReport> {
        self.trigger(EventKind::PurgeAll)
    }

    /// Run the consumer for events published with deferred consumption.
    pub fn flush(&self) -> ConsumeReport {
        self.consumer.consume_all()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionEngine};
    use crate::cache::config::CacheConfig;
    use crate::cache::engine::PageCacheEngine;

    fn trigger(config: CacheConfig) -> (TempDir, CacheTrigger) {
        let dir = TempDir::new().expect("temp dir");
        let engine = Arc::new(PageCacheEngine::new(
            CacheConfig {
                root: dir.path().to_path_buf(),
                ..config
            },
            Arc::new(AdmissionEngine::new(AdmissionConfig::default())),
        ));
        (dir, CacheTrigger::from_engine(engine))
    }

    fn deferred() -> CacheConfig {
        CacheConfig {
            consume_immediately: false,
            ..Default::default()
        }
    }

    #[test]
    fn immediate_mode_consumes_on_publish() {
        let (_dir, trigger) = trigger(CacheConfig::default());
        let report = trigger.on_content_changed(42).expect("consumed");
        assert_eq!(report.events, 1);
        assert!(trigger.queue().is_empty());
    }

    #[test]
    fn deferred_mode_queues_until_flush() {
        let (_dir, trigger) = trigger(deferred());
        let queue = trigger.queue();
        assert!(trigger.on_content_deleted(1).is_none());
        assert!(trigger.on_term_changed(2).is_none());
        assert!(trigger.purge_url("https://example.com/").is_none());
        assert!(trigger.on_environment_changed().is_none());
        assert!(trigger.purge_all().is_none());
        assert_eq!(queue.len(), 5);

        assert_eq!(trigger.flush().events, 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn configured_queue_limit_drops_the_oldest_events() {
        let (_dir, trigger) = trigger(CacheConfig {
            event_queue_limit: 2,
            ..deferred()
        });
        assert!(trigger.on_content_changed(1).is_none());
        assert!(trigger.on_content_changed(2).is_none());
        assert!(trigger.on_content_changed(3).is_none());
        assert_eq!(trigger.queue().len(), 2);

        let drained = trigger.queue().drain(usize::MAX);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, EventKind::ContentChanged { id: 2 });
        assert_eq!(trigger.flush().events, 0);
    }

    #[test]
    fn zero_queue_limit_still_keeps_the_latest_event() {
        let (_dir, trigger) = trigger(CacheConfig {
            event_queue_limit: 0,
            ..deferred()
        });
        assert!(trigger.on_term_changed(4).is_none());
        assert!(trigger.on_term_changed(5).is_none());
        assert_eq!(trigger.queue().len(), 1);
        assert_eq!(trigger.flush().events, 1);
    }
}
