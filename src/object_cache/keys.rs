//! Effective storage keys: `[prefix:]namespace:group:key`.

use super::config::ObjectCacheConfig;

pub const DEFAULT_GROUP: &str = "default";

/// Empty group names fall back to [`DEFAULT_GROUP`].
pub fn group_or_default(group: &str) -> &str {
    if group.is_empty() { DEFAULT_GROUP } else { group }
}

pub fn effective_key(config: &ObjectCacheConfig, key: &str, group: &str) -> String {
    let group = group_or_default(group);
    let mut out = String::new();
    if let Some(prefix) = config.key_prefix.as_deref().filter(|p| !p.is_empty()) {
        out.push_str(prefix);
        out.push(':');
    }
    if !config.is_global(group) {
        out.push_str(&config.namespace);
        out.push(':');
    }
    out.push_str(group);
    out.push(':');
    out.push_str(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_unless_global() {
        let config = ObjectCacheConfig::default();
        assert_eq!(effective_key(&config, "42", "posts"), "site-1:posts:42");
        assert_eq!(effective_key(&config, "7", "users"), "users:7");
        assert_eq!(effective_key(&config, "k", ""), "site-1:default:k");
    }

    #[test]
    fn prefix_goes_first() {
        let config = ObjectCacheConfig {
            key_prefix: Some("salt".to_string()),
            ..Default::default()
        };
        assert_eq!(effective_key(&config, "7", "users"), "salt:users:7");
        assert_eq!(effective_key(&config, "1", "posts"), "salt:site-1:posts:1");
    }
}
