//! Redis adapter.
//!
//! One synchronous connection behind a mutex. A transport failure drops the
//! connection; the next operation dials again.

use std::sync::Mutex;
use std::time::Duration;

use redis::{Client, Connection, RedisError, RedisResult, Script};
use tracing::warn;
use url::Url;

use super::{BackendAdapter, BackendError, BackendKind, BackendStats, SetMode};
use crate::cache::lock::mutex_lock;
use crate::object_cache::config::ObjectCacheConfig;

const SOURCE: &str = "object_cache::backend::redis";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Add a signed delta to an integer value, flooring at zero and keeping the TTL.
const ADJUST_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then return false end
local n = tonumber(current)
if not n or n ~= math.floor(n) then return false end
n = n + tonumber(ARGV[1])
if n < 0 then n = 0 end
redis.call('SET', KEYS[1], string.format('%d', n), 'KEEPTTL')
return n
";

pub struct RedisBackend {
    client: Client,
    address: String,
    connection: Mutex<Option<Connection>>,
    adjust: Script,
}

impl RedisBackend {
    pub fn connect(config: &ObjectCacheConfig) -> Result<Self, BackendError> {
        let port = config.port_for(BackendKind::Redis);
        let address = format!("{}:{}", config.host, port);
        let url = connection_url(config, port)?;
        let client = Client::open(url.as_str())
            .map_err(|err| BackendError::connect(BackendKind::Redis, &address, err))?;
        let backend = Self {
            client,
            address,
            connection: Mutex::new(None),
            adjust: Script::new(ADJUST_SCRIPT),
        };
        let connection = backend.open()?;
        *mutex_lock(&backend.connection, SOURCE, "connect") = Some(connection);
        Ok(backend)
    }

    fn open(&self) -> Result<Connection, BackendError> {
        let connection = self
            .client
            .get_connection_with_timeout(CONNECT_TIMEOUT)
            .map_err(|err| BackendError::connect(BackendKind::Redis, &self.address, err))?;
        connection.set_read_timeout(Some(IO_TIMEOUT))?;
        connection.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(connection)
    }

    fn with_connection<T>(
        &self,
        op: &'static str,
        command: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, BackendError> {
        let mut slot = mutex_lock(&self.connection, SOURCE, op);
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        let connection = slot.as_mut().ok_or_else(|| {
            BackendError::connect(BackendKind::Redis, &self.address, "connection missing")
        })?;
        command(connection).map_err(|err| {
            if is_transport_error(&err) {
                warn!(
                    target = "object_cache::backend",
                    op,
                    backend = "redis",
                    result = "disconnected",
                    error = %err,
                    "Dropping Redis connection; next call reconnects"
                );
                *slot = None;
            }
            BackendError::from(err)
        })
    }

    fn adjust_by(
        &self,
        key: &str,
        delta: i128,
        op: &'static str,
    ) -> Result<Option<i64>, BackendError> {
        let delta = delta.to_string();
        self.with_connection(op, |conn| {
            self.adjust.key(key).arg(&delta).invoke::<Option<i64>>(conn)
        })
    }
}

fn is_transport_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
}

fn connection_url(config: &ObjectCacheConfig, port: u16) -> Result<Url, BackendError> {
    let address = format!("{}:{}", config.host, port);
    let mut url = Url::parse(&format!("redis://{address}/{}", config.database))
        .map_err(|err| BackendError::connect(BackendKind::Redis, &address, err))?;
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(password)).map_err(|()| {
            BackendError::connect(BackendKind::Redis, &address, "password rejected by URL")
        })?;
    }
    Ok(url)
}

impl BackendAdapter for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn ping(&self) -> Result<(), BackendError> {
        self.with_connection("ping", |conn| redis::cmd("PING").query::<()>(conn))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.with_connection("get", |conn| {
            redis::cmd("GET").arg(key).query::<Option<Vec<u8>>>(conn)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        match mode {
            SetMode::Always => {}
            SetMode::IfAbsent => {
                cmd.arg("NX");
            }
            SetMode::IfPresent => {
                cmd.arg("XX");
            }
        }
        let reply = self.with_connection("set", |conn| cmd.query::<Option<String>>(conn))?;
        Ok(reply.is_some())
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let removed = self.with_connection("delete", |conn| {
            redis::cmd("DEL").arg(key).query::<i64>(conn)
        })?;
        Ok(removed > 0)
    }

    fn incr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        self.adjust_by(key, i128::from(offset), "incr")
    }

    fn decr(&self, key: &str, offset: u64) -> Result<Option<i64>, BackendError> {
        self.adjust_by(key, -i128::from(offset), "decr")
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.with_connection("flush", |conn| redis::cmd("FLUSHDB").query::<()>(conn))
    }

    fn stats(&self) -> Result<BackendStats, BackendError> {
        let (keys, info) = self.with_connection("stats", |conn| {
            let keys = redis::cmd("DBSIZE").query::<u64>(conn)?;
            let info = redis::cmd("INFO").arg("memory").query::<String>(conn)?;
            Ok((keys, info))
        })?;
        let memory_bytes = info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|value| value.trim().parse().ok());
        Ok(BackendStats {
            keys: Some(keys),
            memory_bytes,
        })
    }
}
