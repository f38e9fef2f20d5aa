//! Cache consumer: drains events, plans, invalidates.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::engine::PageCacheEngine;
use super::events::EventQueue;
use super::planner::ConsumptionPlan;

const METRIC_CONSUME_MS: &str = "sitecache_consume_ms";

/// Summary of one consumption run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub events: usize,
    pub removed: usize,
}

pub struct CacheConsumer {
    engine: Arc<PageCacheEngine>,
    queue: Arc<EventQueue>,
    batch_limit: usize,
}

impl CacheConsumer {
    pub fn new(engine: Arc<PageCacheEngine>, queue: Arc<EventQueue>) -> Self {
        let batch_limit = engine.config().consume_batch_limit.max(1);
        Self {
            engine,
            queue,
            batch_limit,
        }
    }

    /// Consume one batch. Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub fn consume(&self) -> Option<ConsumeReport> {
        let started_at = Instant::now();
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return None;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = ConsumptionPlan::from_events(events);
        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption starting"
        );

        let removed = self.execute(&plan);

        info!(event_count, removed, "Cache consumption complete");
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        Some(ConsumeReport {
            events: event_count,
            removed,
        })
    }

    /// Consume batches until the queue is empty.
    pub fn consume_all(&self) -> ConsumeReport {
        let mut total = ConsumeReport::default();
        while let Some(report) = self.consume() {
            total.events += report.events;
            total.removed += report.removed;
        }
        total
    }

    fn execute(&self, plan: &ConsumptionPlan) -> usize {
        if plan.purge_all {
            return self.engine.invalidate_all();
        }

        let mut removed = 0;
        for entity in &plan.invalidate_entities {
            removed += self.engine.invalidate_entity(entity);
        }
        for entity in &plan.forget_entities {
            self.engine.forget_entity(entity);
        }
        for url in &plan.purge_urls {
            match self.engine.purge_url(url) {
                Ok(count) => removed += count,
                Err(err) => warn!(
                    target = "cache::consumer",
                    op = "purge_url",
                    url = %url,
                    error = %err,
                    "Skipping purge of invalid URL"
                ),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionEngine, RequestContext};
    use crate::cache::config::CacheConfig;
    use crate::cache::engine::RequestState;
    use crate::cache::events::EventKind;
    use crate::cache::keys::{EntityKey, Fingerprint, OutputFormat};

    fn setup(batch: usize) -> (TempDir, Arc<PageCacheEngine>, Arc<EventQueue>, CacheConsumer) {
        let dir = TempDir::new().expect("temp dir");
        let engine = Arc::new(PageCacheEngine::new(
            CacheConfig {
                root: dir.path().to_path_buf(),
                consume_batch_limit: batch,
                ..Default::default()
            },
            Arc::new(AdmissionEngine::new(AdmissionConfig::default())),
        ));
        let queue = Arc::new(EventQueue::new());
        let consumer = CacheConsumer::new(engine.clone(), queue.clone());
        (dir, engine, queue, consumer)
    }

    fn store(engine: &PageCacheEngine, path: &str, deps: &[EntityKey]) -> Fingerprint {
        let RequestState::Cacheable { key, fingerprint } = engine.begin(
            &RequestContext::get("example.com", path),
            OutputFormat::Html,
        ) else {
            panic!("expected cacheable request");
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let outcome = engine.finish(
            &key,
            &fingerprint,
            StatusCode::OK,
            &headers,
            Bytes::from(vec![b'x'; 512]),
            deps.iter().cloned().collect::<HashSet<_>>(),
        );
        assert!(outcome.is_stored());
        fingerprint
    }

    #[test]
    fn empty_queue_is_a_no_op() {
        let (_dir, _engine, _queue, consumer) = setup(10);
        assert_eq!(consumer.consume(), None);
    }

    #[test]
    fn content_change_removes_dependent_pages() {
        let (_dir, engine, queue, consumer) = setup(10);
        let post = store(&engine, "/blog/post", &[EntityKey::Content(42)]);
        let about = store(&engine, "/about", &[EntityKey::Content(1)]);

        queue.publish(EventKind::ContentChanged { id: 42 });
        let report = consumer.consume().expect("one batch");
        assert_eq!(report.events, 1);
        assert_eq!(report.removed, 1);
        assert!(engine.lookup(&post).is_none());
        assert!(engine.lookup(&about).is_some());
    }

    #[test]
    fn deleted_content_leaves_the_registry() {
        let (_dir, engine, queue, consumer) = setup(10);
        store(&engine, "/a", &[EntityKey::Content(5)]);
        queue.publish(EventKind::ContentDeleted { id: 5 });
        consumer.consume();
        assert_eq!(engine.registry().entity_count(), 0);
    }

    #[test]
    fn environment_change_clears_everything() {
        let (_dir, engine, queue, consumer) = setup(10);
        store(&engine, "/a", &[]);
        store(&engine, "/b", &[]);
        queue.publish(EventKind::EnvironmentChanged);
        assert_eq!(consumer.consume().map(|r| r.removed), Some(2));
        assert_eq!(engine.usage().expect("usage").entries, 0);
    }

    #[test]
    fn consume_all_drains_in_batches() {
        let (_dir, engine, queue, consumer) = setup(2);
        let fingerprint = store(&engine, "/x", &[]);
        for id in 0..4 {
            queue.publish(EventKind::ContentChanged { id });
        }
        queue.publish(EventKind::UrlPurged {
            url: "https://example.com/x".to_string(),
        });
        queue.publish(EventKind::UrlPurged {
            url: "not a url".to_string(),
        });

        let report = consumer.consume_all();
        assert_eq!(report.events, 6);
        assert!(queue.is_empty());
        assert!(engine.lookup(&fingerprint).is_none());
    }
}
