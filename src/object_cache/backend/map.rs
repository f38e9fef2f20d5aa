//! In-process map adapters.
//!
//! `Memory` owns its map and dies with the façade. `Shared` attaches to a
//! named segment that every cache in the process sees, which is what an
//! APCu-style store gives a single host.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use time::OffsetDateTime;

use super::{BackendAdapter, BackendError, BackendKind, BackendStats, SetMode};
use crate::cache::clock::Clock;

type Segment = DashMap<String, MapEntry>;

static SHARED_SEGMENTS: Lazy<DashMap<String, Arc<Segment>>> = Lazy::new(DashMap::new);

#[derive(Debug, Clone)]
struct MapEntry {
    value: Vec<u8>,
    expires_at: Option<OffsetDateTime>,
}

impl MapEntry {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

pub struct MapBackend {
    kind: BackendKind,
    entries: Arc<Segment>,
    clock: Arc<dyn Clock>,
}

impl MapBackend {
    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            kind: BackendKind::Memory,
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Attach to the process-wide segment `name`, creating it on first use.
    pub fn shared(name: &str, clock: Arc<dyn Clock>) -> Self {
        let entries = SHARED_SEGMENTS
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();
        Self {
            kind: BackendKind::Shared,
            entries,
            clock,
        }
    }

    fn adjust(&self, key: &str, delta: i128) -> Option<i64> {
        let now = self.clock.now();
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_live(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            return None;
        }
        let current: i64 = std::str::from_utf8(&entry.value).ok()?.trim().parse().ok()?;
        let next = (i128::from(current) + delta).clamp(0, i128::from(i64::MAX)) as i64;
        entry.value = next.to_string().into_bytes();
        Some(next)
    }
}

impl BackendAdapter for MapBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let now = self.clock.now();
        let value = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));
        match value {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let fresh = MapEntry {
            value: value.to_vec(),
            expires_at: ttl.map(|ttl| now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now);
                if (mode == SetMode::IfAbsent && live) || (mode == SetMode::IfPresent && !live) {
                    return Ok(false);
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                if mode == SetMode::IfPresent {
                    return Ok(false);
                }
                vacant.insert(fresh);
            }
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    fn incr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        Ok(self.adjust(key, i128::from(offset)))
    }

    fn decr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        Ok(self.adjust(key, -i128::from(offset)))
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> Result<BackendStats, BackendError> {
        let now = self.clock.now();
        let mut keys = 0u64;
        let mut bytes = 0u64;
        for entry in self.entries.iter().filter(|e| e.is_live(now)) {
            keys += 1;
            bytes += (entry.key().len() + entry.value.len()) as u64;
        }
        Ok(BackendStats {
            keys: Some(keys),
            memory_bytes: Some(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use time::Duration as TimeDuration;

    use super::*;
    use crate::cache::clock::ManualClock;

    fn memory() -> (Arc<ManualClock>, MapBackend) {
        let clock = Arc::new(ManualClock::default());
        (clock.clone(), MapBackend::memory(clock))
    }

    #[test]
    fn add_and_replace_respect_presence() {
        let (_clock, map) = memory();
        assert!(!map.set("k", b"1", None, SetMode::IfPresent).unwrap());
        assert!(map.set("k", b"1", None, SetMode::IfAbsent).unwrap());
        assert!(!map.set("k", b"2", None, SetMode::IfAbsent).unwrap());
        assert!(map.set("k", b"3", None, SetMode::IfPresent).unwrap());
        assert_eq!(map.get("k").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn expired_entries_count_as_absent() {
        let (clock, map) = memory();
        map.set("k", b"1", Some(Duration::from_secs(10)), SetMode::Always)
            .unwrap();
        clock.advance(TimeDuration::seconds(10));
        assert_eq!(map.get("k").unwrap(), None);
        assert!(map.set("k", b"2", None, SetMode::IfAbsent).unwrap());
        assert_eq!(map.stats().unwrap().keys, Some(1));
    }

    #[test]
    fn counters_are_numeric_and_floor_at_zero() {
        let (_clock, map) = memory();
        assert_eq!(map.incr("n", 1).unwrap(), None);
        map.set("n", b"5", None, SetMode::Always).unwrap();
        assert_eq!(map.incr("n", 3).unwrap(), Some(8));
        assert_eq!(map.decr("n", 20).unwrap(), Some(0));
        map.set("s", b"\"text\"", None, SetMode::Always).unwrap();
        assert_eq!(map.incr("s", 1).unwrap(), None);
    }

    #[test]
    fn shared_segments_are_visible_across_instances() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let a = MapBackend::shared("map-tests-segment", clock.clone());
        let b = MapBackend::shared("map-tests-segment", clock.clone());
        let other = MapBackend::shared("map-tests-other", clock);
        a.set("k", b"1", None, SetMode::Always).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(other.get("k").unwrap(), None);
        assert!(b.delete("k").unwrap());
        assert_eq!(a.get("k").unwrap(), None);
    }
}
