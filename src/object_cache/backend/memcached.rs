//! Memcached adapter.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memcache::{Client, MemcacheError};
use sha2::{Digest, Sha256};

use super::{BackendAdapter, BackendError, BackendKind, BackendStats, SetMode};
use crate::object_cache::config::ObjectCacheConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_KEY_LEN: usize = 250;
/// Memcached reads larger expirations as absolute unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

pub struct MemcachedBackend {
    client: Client,
}

impl MemcachedBackend {
    pub fn connect(config: &ObjectCacheConfig) -> Result<Self, BackendError> {
        let address = format!("{}:{}", config.host, config.port_for(BackendKind::Memcached));
        probe(&address)?;
        let client = Client::connect(format!("memcache://{address}?timeout=1&tcp_nodelay=true"))
            .map_err(|err| BackendError::connect(BackendKind::Memcached, &address, err))?;
        Ok(Self { client })
    }
}

/// Plain TCP reachability check, bounded by [`CONNECT_TIMEOUT`].
fn probe(address: &str) -> Result<(), BackendError> {
    let failed = |reason: &dyn std::fmt::Display| {
        BackendError::connect(BackendKind::Memcached, address, reason)
    };
    let socket: SocketAddr = address
        .to_socket_addrs()
        .map_err(|err| failed(&err))?
        .next()
        .ok_or_else(|| failed(&"no address resolved"))?;
    TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT).map_err(|err| failed(&err))?;
    Ok(())
}

/// Keys memcached would reject are replaced by their SHA-256.
fn wire_key(key: &str) -> String {
    let acceptable = key.len() <= MAX_KEY_LEN
        && !key
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if acceptable {
        key.to_string()
    } else {
        format!("sha256:{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn expiration(ttl: Option<Duration>) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let seconds = ttl.as_secs().max(1);
    if seconds <= MAX_RELATIVE_EXPIRATION {
        return seconds as u32;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    u32::try_from(now + seconds).unwrap_or(u32::MAX)
}

/// "Not stored" and "not found" answers are outcomes, not failures.
fn is_refusal(err: &MemcacheError) -> bool {
    matches!(
        err,
        MemcacheError::CommandError(_) | MemcacheError::ClientError(_)
    )
}

fn refused_as<T>(result: Result<T, MemcacheError>, refused: T) -> Result<T, BackendError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if is_refusal(&err) => Ok(refused),
        Err(err) => Err(err.into()),
    }
}

impl BackendAdapter for MemcachedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memcached
    }

    fn ping(&self) -> Result<(), BackendError> {
        self.client.version()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.client.get::<Vec<u8>>(&wire_key(key))?)
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, BackendError> {
        let key = wire_key(key);
        let expiration = expiration(ttl);
        let result = match mode {
            SetMode::Always => self.client.set(&key, value, expiration),
            SetMode::IfAbsent => self.client.add(&key, value, expiration),
            SetMode::IfPresent => self.client.replace(&key, value, expiration),
        };
        refused_as(result.map(|()| true), false)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.client.delete(&wire_key(key))?)
    }

    fn incr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        let result = self.client.increment(&wire_key(key), offset);
        refused_as(result.map(|value| Some(value as i64)), None)
    }

    fn decr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        // memcached clamps decrements at zero itself.
        let result = self.client.decrement(&wire_key(key), offset);
        refused_as(result.map(|value| Some(value as i64)), None)
    }

    fn flush(&self) -> Result<(), BackendError> {
        Ok(self.client.flush()?)
    }

    fn stats(&self) -> Result<BackendStats, BackendError> {
        let servers = self.client.stats()?;
        let sum = |name: &str| -> Option<u64> {
            servers
                .iter()
                .map(|(_, stats)| stats.get(name).and_then(|v| v.parse::<u64>().ok()))
                .sum()
        };
        Ok(BackendStats {
            keys: sum("curr_items"),
            memory_bytes: sum("bytes"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_pass_through() {
        assert_eq!(wire_key("site-1:posts:42"), "site-1:posts:42");
    }

    #[test]
    fn long_or_spaced_keys_are_hashed() {
        let spaced = wire_key("site-1:posts:hello world");
        assert!(spaced.starts_with("sha256:"));
        assert_eq!(spaced.len(), "sha256:".len() + 64);
        assert_eq!(spaced, wire_key("site-1:posts:hello world"));

        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(wire_key(&long).starts_with("sha256:"));
    }

    #[test]
    fn long_ttls_become_timestamps() {
        assert_eq!(expiration(None), 0);
        assert_eq!(expiration(Some(Duration::from_millis(10))), 1);
        assert_eq!(expiration(Some(Duration::from_secs(60))), 60);
        let far = Duration::from_secs(MAX_RELATIVE_EXPIRATION + 1);
        assert!(expiration(Some(far)) > 1_600_000_000);
    }

    #[test]
    fn unreachable_server_fails_the_probe() {
        let err = probe("127.0.0.1:1").expect_err("nothing listens on port 1");
        assert!(matches!(
            err,
            BackendError::Connect {
                backend: BackendKind::Memcached,
                ..
            }
        ));
    }
}
