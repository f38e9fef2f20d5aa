//! Process-local overlay in front of the backend.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use time::OffsetDateTime;

use crate::cache::clock::Clock;
use crate::cache::lock::rw_write;

const SOURCE: &str = "object_cache::overlay";

#[derive(Debug, Clone)]
struct OverlayEntry {
    value: Vec<u8>,
    expires_at: Option<OffsetDateTime>,
}

/// LRU-bounded map of effective key to serialized value.
pub struct Overlay {
    entries: RwLock<LruCache<String, OverlayEntry>>,
    clock: Arc<dyn Clock>,
}

impl Overlay {
    pub fn new(limit: NonZeroUsize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(limit)),
            clock,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Live value for `key`; an expired entry is dropped on the way.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = entries
            .peek(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| at <= now));
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&self, key: String, value: Vec<u8>, expires_at: Option<OffsetDateTime>) {
        rw_write(&self.entries, SOURCE, "put").put(key, OverlayEntry { value, expires_at });
    }

    /// Add `delta` to a live integer value in place, flooring at zero.
    pub fn adjust(&self, key: &str, delta: i128) -> Option<i64> {
        let now = self.clock.now();
        let mut entries = rw_write(&self.entries, SOURCE, "adjust");
        let entry = entries.get_mut(key)?;
        if entry.expires_at.is_some_and(|at| at <= now) {
            entries.pop(key);
            return None;
        }
        let current: i64 = std::str::from_utf8(&entry.value).ok()?.trim().parse().ok()?;
        let next = (i128::from(current) + delta).clamp(0, i128::from(i64::MAX)) as i64;
        entry.value = next.to_string().into_bytes();
        Some(next)
    }

    pub fn remove(&self, key: &str) -> bool {
        rw_write(&self.entries, SOURCE, "remove").pop(key).is_some()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        rw_write(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::cache::clock::ManualClock;

    fn overlay(limit: usize) -> (Arc<ManualClock>, Overlay) {
        let clock = Arc::new(ManualClock::default());
        let overlay = Overlay::new(NonZeroUsize::new(limit).unwrap(), clock.clone());
        (clock, overlay)
    }

    #[test]
    fn entries_expire() {
        let (clock, overlay) = overlay(4);
        let expires = overlay.now() + Duration::seconds(5);
        overlay.put("a".to_string(), b"1".to_vec(), Some(expires));
        overlay.put("b".to_string(), b"2".to_vec(), None);
        assert_eq!(overlay.get("a"), Some(b"1".to_vec()));

        clock.advance(Duration::seconds(5));
        assert_eq!(overlay.get("a"), None);
        assert_eq!(overlay.get("b"), Some(b"2".to_vec()));
        assert_eq!(overlay.len(), 1);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let (_clock, overlay) = overlay(2);
        overlay.put("a".to_string(), b"1".to_vec(), None);
        overlay.put("b".to_string(), b"2".to_vec(), None);
        assert!(overlay.contains("a"));
        overlay.put("c".to_string(), b"3".to_vec(), None);
        assert!(overlay.contains("a"));
        assert!(!overlay.contains("b"));
    }

    #[test]
    fn adjust_keeps_integers_only() {
        let (_clock, overlay) = overlay(4);
        overlay.put("n".to_string(), b"2".to_vec(), None);
        overlay.put("s".to_string(), b"\"2\"".to_vec(), None);
        assert_eq!(overlay.adjust("n", 3), Some(5));
        assert_eq!(overlay.adjust("n", -9), Some(0));
        assert_eq!(overlay.adjust("s", 1), None);
        assert_eq!(overlay.adjust("missing", 1), None);
    }

    #[test]
    fn remove_and_clear() {
        let (_clock, overlay) = overlay(4);
        overlay.put("a".to_string(), b"1".to_vec(), None);
        assert!(overlay.remove("a"));
        assert!(!overlay.remove("a"));
        overlay.put("b".to_string(), b"2".to_vec(), None);
        overlay.clear();
        assert!(overlay.is_empty());
    }
}
