//! Backend-agnostic object cache.
//!
//! Values are stored as JSON, so integers stay native for `incr`/`decr`.
//! Every backend failure is logged and absorbed; callers only ever see
//! `false` or `None`.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::backend::{self, BackendAdapter, BackendError, BackendKind, BackendStats, SetMode};
use super::config::ObjectCacheConfig;
use super::keys::{effective_key, group_or_default};
use super::overlay::Overlay;
use crate::cache::clock::{Clock, SystemClock};
use crate::cache::{CacheStats, HitCounter};

const METRIC_HIT: &str = "sitecache_object_hit_total";
const METRIC_MISS: &str = "sitecache_object_miss_total";
const METRIC_BACKEND_ERROR: &str = "sitecache_object_backend_error_total";

#[derive(Debug, Clone, Serialize)]
pub struct ObjectCacheStats {
    /// `None` when the cache runs on the overlay alone.
    pub backend: Option<BackendKind>,
    #[serde(flatten)]
    pub lookups: CacheStats,
    pub overlay_entries: usize,
    pub backend_stats: Option<BackendStats>,
}

pub struct ObjectCache {
    config: ObjectCacheConfig,
    backend: Option<Arc<dyn BackendAdapter>>,
    overlay: Overlay,
    counter: HitCounter,
}

impl ObjectCache {
    /// Select a backend from the configuration and build the façade.
    pub fn new(config: ObjectCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ObjectCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let backend = config
            .enabled
            .then(|| backend::select(&config, clock.clone()));
        Self::build(config, backend, clock)
    }

    /// Use an already-built adapter, skipping selection.
    pub fn with_backend(
        config: ObjectCacheConfig,
        backend: Arc<dyn BackendAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(config, Some(backend), clock)
    }

    fn build(
        config: ObjectCacheConfig,
        backend: Option<Arc<dyn BackendAdapter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let overlay = Overlay::new(config.overlay_limit_non_zero(), clock);
        Self {
            config,
            backend,
            overlay,
            counter: HitCounter::new(),
        }
    }

    pub fn config(&self) -> &ObjectCacheConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|backend| backend.kind())
    }

    /// Store only if no live value exists under the key.
    pub fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T, group: &str, ttl: u64) -> bool {
        self.write("add", key, value, group, ttl, SetMode::IfAbsent)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, group: &str, ttl: u64) -> bool {
        self.write("set", key, value, group, ttl, SetMode::Always)
    }

    /// Store only if a live value already exists under the key.
    pub fn replace<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        group: &str,
        ttl: u64,
    ) -> bool {
        self.write("replace", key, value, group, ttl, SetMode::IfPresent)
    }

    /// Look a value up, consulting the overlay first unless `force` is set.
    pub fn get<T: DeserializeOwned>(&self, key: &str, group: &str, force: bool) -> Option<T> {
        let group = group_or_default(group);
        let key = effective_key(&self.config, key, group);
        let found = self.fetch(&key, group, force);
        let value = found.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = "object_cache",
                    op = "get",
                    key = %key,
                    result = "decode_error",
                    error = %err,
                    "Cached value does not decode to the requested type"
                );
                None
            }
        });
        if value.is_some() {
            self.counter.record_hit();
            counter!(METRIC_HIT).increment(1);
        } else {
            self.counter.record_miss();
            counter!(METRIC_MISS).increment(1);
        }
        value
    }

    pub fn delete(&self, key: &str, group: &str) -> bool {
        let group = group_or_default(group);
        let key = effective_key(&self.config, key, group);
        let in_overlay = self.overlay.remove(&key);
        let Some(backend) = self.persistent_backend(group) else {
            return in_overlay;
        };
        match backend.delete(&key) {
            Ok(removed) => removed || in_overlay,
            Err(err) => {
                self.backend_failed("delete", backend.kind(), &err);
                in_overlay
            }
        }
    }

    /// Clear the backend and the overlay. `false` if the backend refused.
    pub fn flush(&self) -> bool {
        self.overlay.clear();
        let Some(backend) = &self.backend else {
            return true;
        };
        match backend.flush() {
            Ok(()) => true,
            Err(err) => {
                self.backend_failed("flush", backend.kind(), &err);
                false
            }
        }
    }

    /// Increment an integer value. `None` if absent, not numeric, or the
    /// backend failed.
    pub fn incr(&self, key: &str, offset: u64, group: &str) -> Option<i64> {
        self.adjust("incr", key, i128::from(offset), group)
    }

    /// Decrement an integer value, flooring at zero.
    pub fn decr(&self, key: &str, offset: u64, group: &str) -> Option<i64> {
        self.adjust("decr", key, -i128::from(offset), group)
    }

    pub fn stats(&self) -> ObjectCacheStats {
        let backend_stats = self.backend.as_ref().and_then(|backend| {
            backend
                .stats()
                .inspect_err(|err| self.backend_failed("stats", backend.kind(), err))
                .ok()
        });
        ObjectCacheStats {
            backend: self.backend_kind(),
            lookups: self.counter.snapshot(),
            overlay_entries: self.overlay.len(),
            backend_stats,
        }
    }

    pub fn reset_stats(&self) {
        self.counter.reset();
    }

    fn persistent_backend(&self, group: &str) -> Option<&Arc<dyn BackendAdapter>> {
        if self.config.is_non_persistent(group) {
            return None;
        }
        self.backend.as_ref()
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        op: &'static str,
        key: &str,
        value: &T,
        group: &str,
        ttl: u64,
        mode: SetMode,
    ) -> bool {
        let group = group_or_default(group);
        let key = effective_key(&self.config, key, group);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    target = "object_cache",
                    op,
                    key = %key,
                    result = "encode_error",
                    error = %err,
                    "Value cannot be serialized for the object cache"
                );
                return false;
            }
        };
        let ttl = self.effective_ttl(ttl);

        let Some(backend) = self.persistent_backend(group) else {
            return self.write_overlay(key, bytes, ttl, mode);
        };
        match backend.set(&key, &bytes, ttl, mode) {
            Ok(true) => {
                self.cache_locally(key, bytes, ttl);
                true
            }
            Ok(false) => false,
            Err(err) => {
                self.backend_failed(op, backend.kind(), &err);
                self.write_overlay(key, bytes, ttl, mode);
                false
            }
        }
    }

    fn write_overlay(
        &self,
        key: String,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> bool {
        let present = self.overlay.contains(&key);
        if (mode == SetMode::IfAbsent && present) || (mode == SetMode::IfPresent && !present) {
            return false;
        }
        let expires_at = ttl.map(|ttl| self.overlay.now() + ttl);
        self.overlay.put(key, bytes, expires_at);
        true
    }

    /// Remember a backend value, capped at `overlay_max_age`.
    fn cache_locally(&self, key: String, bytes: Vec<u8>, ttl: Option<Duration>) {
        if self.config.overlay_max_age_seconds == 0 {
            return;
        }
        let max_age = Duration::from_secs(self.config.overlay_max_age_seconds);
        let lifetime = ttl.map_or(max_age, |ttl| ttl.min(max_age));
        let expires_at: OffsetDateTime = self.overlay.now() + lifetime;
        self.overlay.put(key, bytes, Some(expires_at));
    }

    fn fetch(&self, key: &str, group: &str, force: bool) -> Option<Vec<u8>> {
        let Some(backend) = self.persistent_backend(group) else {
            return self.overlay.get(key);
        };
        if !force && let Some(bytes) = self.overlay.get(key) {
            debug!(cache = "object", outcome = "hit", layer = "overlay", key = %key);
            return Some(bytes);
        }
        match backend.get(key) {
            Ok(Some(bytes)) => {
                self.cache_locally(key.to_string(), bytes.clone(), None);
                Some(bytes)
            }
            Ok(None) => {
                self.overlay.remove(key);
                None
            }
            Err(err) => {
                self.backend_failed("get", backend.kind(), &err);
                self.overlay.get(key)
            }
        }
    }

    fn adjust(&self, op: &'static str, key: &str, delta: i128, group: &str) -> Option<i64> {
        let group = group_or_default(group);
        let key = effective_key(&self.config, key, group);
        let Some(backend) = self.persistent_backend(group) else {
            return self.overlay.adjust(&key, delta);
        };
        let magnitude = delta.unsigned_abs().min(u128::from(u64::MAX)) as u64;
        let result = if delta >= 0 {
            backend.incr(&key, magnitude)
        } else {
            backend.decr(&key, magnitude)
        };
        match result {
            Ok(Some(value)) => {
                self.cache_locally(key, value.to_string().into_bytes(), None);
                Some(value)
            }
            Ok(None) => {
                self.overlay.remove(&key);
                None
            }
            Err(err) => {
                self.backend_failed(op, backend.kind(), &err);
                self.overlay.adjust(&key, delta)
            }
        }
    }

    fn effective_ttl(&self, ttl: u64) -> Option<Duration> {
        let seconds = if ttl == 0 {
            self.config.default_ttl_seconds
        } else {
            ttl
        };
        (seconds > 0).then(|| Duration::from_secs(seconds))
    }

    fn backend_failed(&self, op: &'static str, backend: BackendKind, err: &BackendError) {
        warn!(
            target = "object_cache",
            op,
            backend = %backend,
            result = "backend_error",
            error = %err,
            "Object cache backend call failed; continuing without it"
        );
        counter!(METRIC_BACKEND_ERROR, "backend" => backend.as_str(), "op" => op).increment(1);
    }
}
