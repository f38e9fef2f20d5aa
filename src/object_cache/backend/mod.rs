//! Storage adapters behind the object cache.
//!
//! Every adapter stores opaque bytes under an already-effective key. The
//! façade turns adapter errors into soft failures; adapters themselves report
//! them faithfully.

mod map;
mod memcached;
mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::config::ObjectCacheConfig;
use crate::cache::clock::Clock;

pub use map::MapBackend;
pub use memcached::MemcachedBackend;
pub use redis::RedisBackend;

/// Probe order when the backend is `auto`.
const AUTO_PRIORITY: [BackendKind; 3] = [
    BackendKind::Redis,
    BackendKind::Memcached,
    BackendKind::Shared,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memcached,
    Shared,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memcached => "memcached",
            Self::Shared => "shared",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write condition for [`BackendAdapter::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Always,
    /// Only when no live value exists (`add`).
    IfAbsent,
    /// Only when a live value exists (`replace`).
    IfPresent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub keys: Option<u64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot reach {backend} at {address}: {reason}")]
    Connect {
        backend: BackendKind,
        address: String,
        reason: String,
    },
    #[error("redis command failed: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("memcached command failed: {0}")]
    Memcached(#[from] ::memcache::MemcacheError),
}

impl BackendError {
    pub(crate) fn connect(
        backend: BackendKind,
        address: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Connect {
            backend,
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Primitive key/value surface shared by every store kind.
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Connectivity test used during selection.
    fn ping(&self) -> Result<(), BackendError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Returns `false` when `mode` prevented the write.
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, BackendError>;

    fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// New value, or `None` when the key is absent or not an integer.
    fn incr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError>;

    /// Like [`incr`](Self::incr); the result never drops below zero.
    fn decr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError>;

    fn flush(&self) -> Result<(), BackendError>;

    fn stats(&self) -> Result<BackendStats, BackendError>;
}

/// Build and probe the adapter for `kind`.
pub fn connect(
    kind: BackendKind,
    config: &ObjectCacheConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn BackendAdapter>, BackendError> {
    let adapter: Arc<dyn BackendAdapter> = match kind {
        BackendKind::Redis => Arc::new(RedisBackend::connect(config)?),
        BackendKind::Memcached => Arc::new(MemcachedBackend::connect(config)?),
        BackendKind::Shared => Arc::new(MapBackend::shared(&config.shared_segment, clock)),
        BackendKind::Memory => Arc::new(MapBackend::memory(clock)),
    };
    adapter.ping()?;
    Ok(adapter)
}

/// Pick the adapter named by the configuration, probing candidates for
/// `auto`. Never fails: the in-process map is the last resort.
pub fn select(config: &ObjectCacheConfig, clock: Arc<dyn Clock>) -> Arc<dyn BackendAdapter> {
    match config.backend.kind() {
        Some(kind) => match connect(kind, config, clock.clone()) {
            Ok(adapter) => {
                info!(backend = %kind, "Object cache backend selected");
                adapter
            }
            Err(err) => {
                warn!(
                    target = "object_cache::backend",
                    op = "select",
                    backend = %kind,
                    result = "fallback_memory",
                    error = %err,
                    "Configured object cache backend unreachable; using in-process memory"
                );
                Arc::new(MapBackend::memory(clock))
            }
        },
        None => {
            for kind in AUTO_PRIORITY {
                match connect(kind, config, clock.clone()) {
                    Ok(adapter) => {
                        info!(backend = %kind, mode = "auto", "Object cache backend selected");
                        return adapter;
                    }
                    Err(err) => info!(
                        backend = %kind,
                        mode = "auto",
                        error = %err,
                        "Object cache backend candidate unavailable"
                    ),
                }
            }
            Arc::new(MapBackend::memory(clock))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::SystemClock;
    use crate::object_cache::config::BackendChoice;

    fn unreachable(backend: BackendChoice) -> ObjectCacheConfig {
        ObjectCacheConfig {
            backend,
            host: "127.0.0.1".to_string(),
            port: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_unreachable_backend_falls_back_to_memory() {
        let adapter = select(&unreachable(BackendChoice::Redis), Arc::new(SystemClock));
        assert_eq!(adapter.kind(), BackendKind::Memory);
    }

    #[test]
    fn auto_settles_on_shared_without_servers() {
        let adapter = select(&unreachable(BackendChoice::Auto), Arc::new(SystemClock));
        assert_eq!(adapter.kind(), BackendKind::Shared);
    }

    #[test]
    fn explicit_memory_is_used_as_is() {
        let adapter = select(&unreachable(BackendChoice::Memory), Arc::new(SystemClock));
        assert_eq!(adapter.kind(), BackendKind::Memory);
        assert!(adapter.ping().is_ok());
    }
}
