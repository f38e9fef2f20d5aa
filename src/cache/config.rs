//! Page cache configuration.
//!
//! Controls the on-disk page store and the invalidation pipeline via the
//! `[page_cache]` section of `sitecache.toml`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_ROOT: &str = "cache/pages";
const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_MIN_PAYLOAD_BYTES: usize = 200;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_STORABLE_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "application/xhtml+xml",
    "application/xml",
    "text/xml",
    "application/rss+xml",
    "application/atom+xml",
    "application/json",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the bucketed entry files.
    pub root: PathBuf,
    /// Lifetime of a stored page.
    pub ttl_seconds: u64,
    /// Payloads must be strictly larger than this to be stored.
    pub min_payload_bytes: usize,
    pub max_payload_bytes: usize,
    /// Content type prefixes eligible for storage.
    pub storable_content_types: Vec<String>,
    /// Keep a separate copy for mobile user agents.
    pub separate_mobile: bool,
    /// Append an HTML comment to stored HTML pages.
    pub generation_marker: bool,
    /// Hosts whose front page is purged on every content change.
    pub site_hosts: Vec<String>,
    /// Invalidate as soon as an event is published instead of waiting for a consumer run.
    pub consume_immediately: bool,
    /// Pending invalidation events kept before the oldest is dropped.
    pub event_queue_limit: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            min_payload_bytes: DEFAULT_MIN_PAYLOAD_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            storable_content_types: DEFAULT_STORABLE_CONTENT_TYPES
                .iter()
                .map(|item| item.to_string())
                .collect(),
            separate_mobile: true,
            generation_marker: true,
            site_hosts: Vec::new(),
            consume_immediately: true,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl CacheConfig {
    /// Whether a `Content-Type` header value may be written to disk.
    pub fn is_storable_content_type(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.storable_content_types
            .iter()
            .any(|allowed| essence == allowed.to_ascii_lowercase())
    }

    /// Queue limit clamped to at least one slot.
    pub fn event_queue_limit_non_zero(&self) -> usize {
        self.event_queue_limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.root, PathBuf::from("cache/pages"));
        assert_eq!(config.ttl_seconds, 3600);
        assert_eq!(config.min_payload_bytes, 200);
        assert_eq!(config.max_payload_bytes, 5 * 1024 * 1024);
        assert!(config.separate_mobile);
        assert!(config.generation_marker);
        assert!(config.consume_immediately);
        assert_eq!(config.consume_batch_limit, 100);
    }

    #[test]
    fn content_type_check_ignores_parameters_and_case() {
        let config = CacheConfig::default();
        assert!(config.is_storable_content_type("text/html; charset=utf-8"));
        assert!(config.is_storable_content_type("Application/RSS+XML"));
        assert!(!config.is_storable_content_type("image/png"));
        assert!(!config.is_storable_content_type("text/event-stream"));
        assert!(!config.is_storable_content_type(""));
    }

    #[test]
    fn queue_limit_clamps_to_min() {
        let config = CacheConfig {
            event_queue_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.event_queue_limit_non_zero(), 1);
    }
}
