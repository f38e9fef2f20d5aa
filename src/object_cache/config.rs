//! Object cache configuration (`[object_cache]`).

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use super::backend::BackendKind;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_NAMESPACE: &str = "site-1";
const DEFAULT_SHARED_SEGMENT: &str = "sitecache";
const DEFAULT_OVERLAY_LIMIT: usize = 10_000;
const DEFAULT_OVERLAY_MAX_AGE_SECONDS: u64 = 30;
const DEFAULT_GLOBAL_GROUPS: &[&str] = &["users", "userlogins", "site-options", "site-transient"];
const DEFAULT_NON_PERSISTENT_GROUPS: &[&str] = &["counts", "plugins", "themes"];

/// Which backend to talk to. `Auto` probes the candidates in priority order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Redis,
    Memcached,
    /// Process-wide shared segment, the local analogue of APCu.
    #[serde(alias = "apcu")]
    Shared,
    Memory,
}

impl BackendChoice {
    /// The adapter this choice names, `None` for `Auto`.
    pub fn kind(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::Redis => Some(BackendKind::Redis),
            Self::Memcached => Some(BackendKind::Memcached),
            Self::Shared => Some(BackendKind::Shared),
            Self::Memory => Some(BackendKind::Memory),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectCacheConfig {
    /// When off, every call is served by the in-process overlay alone.
    pub enabled: bool,
    pub backend: BackendChoice,
    pub host: String,
    /// Defaults to the backend's well-known port.
    pub port: Option<u16>,
    pub password: Option<String>,
    /// Redis logical database.
    pub database: u8,
    /// Optional salt placed in front of every effective key.
    pub key_prefix: Option<String>,
    /// Tenant identifier for groups that are not global.
    pub namespace: String,
    pub global_groups: Vec<String>,
    /// Groups that never leave this process.
    pub non_persistent_groups: Vec<String>,
    /// Name of the process-wide segment used by the shared backend.
    pub shared_segment: String,
    /// Maximum number of entries in the in-process overlay.
    pub overlay_limit: usize,
    /// Upper bound on how long a persistent-group value is served from the overlay.
    pub overlay_max_age_seconds: u64,
    /// TTL used when a caller passes zero; zero here means no expiry.
    pub default_ttl_seconds: u64,
}

impl Default for ObjectCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Auto,
            host: DEFAULT_HOST.to_string(),
            port: None,
            password: None,
            database: 0,
            key_prefix: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            global_groups: DEFAULT_GLOBAL_GROUPS.iter().map(|g| g.to_string()).collect(),
            non_persistent_groups: DEFAULT_NON_PERSISTENT_GROUPS
                .iter()
                .map(|g| g.to_string())
                .collect(),
            shared_segment: DEFAULT_SHARED_SEGMENT.to_string(),
            overlay_limit: DEFAULT_OVERLAY_LIMIT,
            overlay_max_age_seconds: DEFAULT_OVERLAY_MAX_AGE_SECONDS,
            default_ttl_seconds: 0,
        }
    }
}

impl ObjectCacheConfig {
    pub fn port_for(&self, kind: BackendKind) -> u16 {
        self.port.unwrap_or(match kind {
            BackendKind::Redis => 6379,
            BackendKind::Memcached => 11211,
            BackendKind::Shared | BackendKind::Memory => 0,
        })
    }

    pub fn overlay_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.overlay_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn is_global(&self, group: &str) -> bool {
        self.global_groups.iter().any(|g| g == group)
    }

    pub fn is_non_persistent(&self, group: &str) -> bool {
        self.non_persistent_groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apcu_is_an_alias_for_shared() {
        let config: ObjectCacheConfig =
            serde_json::from_str(r#"{"backend": "apcu", "port": 6380}"#).expect("valid json");
        assert_eq!(config.backend, BackendChoice::Shared);
        assert_eq!(config.port_for(BackendKind::Redis), 6380);
        assert!(config.enabled);
    }

    #[test]
    fn default_ports_and_groups() {
        let config = ObjectCacheConfig::default();
        assert_eq!(config.port_for(BackendKind::Redis), 6379);
        assert_eq!(config.port_for(BackendKind::Memcached), 11211);
        assert!(config.is_global("users"));
        assert!(!config.is_global("posts"));
        assert!(config.is_non_persistent("counts"));
    }

    #[test]
    fn zero_overlay_limit_is_clamped() {
        let config = ObjectCacheConfig {
            overlay_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.overlay_limit_non_zero().get(), 1);
    }
}
