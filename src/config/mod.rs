//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::admission::AdmissionConfig;
use crate::cache::CacheConfig;
use crate::object_cache::{BackendChoice, ObjectCacheConfig};

mod cli;

pub use cli::{
    BackendArg, CheckArgs, CliArgs, Command, InvalidateArgs, Overrides, PurgeUrlArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sitecache";
const ENV_PREFIX: &str = "SITECACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub page_cache: CacheConfig,
    pub admission: AdmissionConfig,
    pub object_cache: ObjectCacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    page_cache: RawPageCacheSettings,
    admission: AdmissionConfig,
    object_cache: RawObjectCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.cache_root.as_ref() {
            self.page_cache.root = Some(root.clone());
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.page_cache.ttl_seconds = Some(ttl);
        }
        if let Some(backend) = overrides.object_cache_backend {
            self.object_cache.backend = Some(backend.as_config_value().to_string());
        }
        if let Some(host) = overrides.object_cache_host.as_ref() {
            self.object_cache.host = Some(host.clone());
        }
        if let Some(port) = overrides.object_cache_port {
            self.object_cache.port = Some(port);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            page_cache,
            admission,
            object_cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let page_cache = build_page_cache_settings(page_cache)?;
        let admission = build_admission_settings(admission)?;
        let object_cache = build_object_cache_settings(object_cache)?;

        Ok(Self {
            logging,
            page_cache,
            admission,
            object_cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_page_cache_settings(raw: RawPageCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let root = raw.root.unwrap_or(defaults.root);
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("page_cache.root", "must not be empty"));
    }

    let ttl_seconds = raw.ttl_seconds.unwrap_or(defaults.ttl_seconds);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "page_cache.ttl_seconds",
            "must be greater than zero",
        ));
    }

    let min_payload_bytes = raw.min_payload_bytes.unwrap_or(defaults.min_payload_bytes);
    let max_payload_bytes = raw.max_payload_bytes.unwrap_or(defaults.max_payload_bytes);
    if max_payload_bytes <= min_payload_bytes {
        return Err(LoadError::invalid(
            "page_cache.max_payload_bytes",
            format!("must be greater than min_payload_bytes ({min_payload_bytes})"),
        ));
    }

    let event_queue_limit = raw.event_queue_limit.unwrap_or(defaults.event_queue_limit);
    if event_queue_limit == 0 {
        return Err(LoadError::invalid(
            "page_cache.event_queue_limit",
            "must be greater than zero",
        ));
    }

    let consume_batch_limit = raw
        .consume_batch_limit
        .unwrap_or(defaults.consume_batch_limit);
    if consume_batch_limit == 0 {
        return Err(LoadError::invalid(
            "page_cache.consume_batch_limit",
            "must be greater than zero",
        ));
    }

    let site_hosts = raw
        .site_hosts
        .unwrap_or(defaults.site_hosts)
        .into_iter()
        .map(|host| host.trim().to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect();

    Ok(CacheConfig {
        root,
        ttl_seconds,
        min_payload_bytes,
        max_payload_bytes,
        storable_content_types: raw
            .storable_content_types
            .unwrap_or(defaults.storable_content_types),
        separate_mobile: raw.separate_mobile.unwrap_or(defaults.separate_mobile),
        generation_marker: raw.generation_marker.unwrap_or(defaults.generation_marker),
        site_hosts,
        consume_immediately: raw
            .consume_immediately
            .unwrap_or(defaults.consume_immediately),
        event_queue_limit,
        consume_batch_limit,
    })
}

fn build_admission_settings(admission: AdmissionConfig) -> Result<AdmissionConfig, LoadError> {
    if admission.search_query_param.trim().is_empty() {
        return Err(LoadError::invalid(
            "admission.search_query_param",
            "must not be empty",
        ));
    }
    if admission
        .session_cookie_prefixes
        .iter()
        .any(|prefix| prefix.trim().is_empty())
    {
        return Err(LoadError::invalid(
            "admission.session_cookie_prefixes",
            "entries must not be empty",
        ));
    }
    Ok(admission)
}

fn build_object_cache_settings(
    raw: RawObjectCacheSettings,
) -> Result<ObjectCacheConfig, LoadError> {
    let defaults = ObjectCacheConfig::default();

    let backend = match raw.backend.as_deref().map(str::trim) {
        None | Some("") => defaults.backend,
        Some(name) => parse_backend(name).ok_or_else(|| {
            LoadError::invalid("object_cache.backend", format!("unknown backend `{name}`"))
        })?,
    };

    let host = raw.host.unwrap_or(defaults.host).trim().to_string();
    if host.is_empty() {
        return Err(LoadError::invalid("object_cache.host", "must not be empty"));
    }

    if raw.port == Some(0) {
        return Err(LoadError::invalid(
            "object_cache.port",
            "port must be greater than zero",
        ));
    }

    let namespace = raw.namespace.unwrap_or(defaults.namespace).trim().to_string();
    if namespace.is_empty() {
        return Err(LoadError::invalid(
            "object_cache.namespace",
            "must not be empty",
        ));
    }

    let overlay_limit = raw.overlay_limit.unwrap_or(defaults.overlay_limit);
    if overlay_limit == 0 {
        return Err(LoadError::invalid(
            "object_cache.overlay_limit",
            "must be greater than zero",
        ));
    }

    Ok(ObjectCacheConfig {
        enabled: raw.enabled.unwrap_or(defaults.enabled),
        backend,
        host,
        port: raw.port,
        password: raw.password.filter(|p| !p.is_empty()),
        database: raw.database.unwrap_or(defaults.database),
        key_prefix: raw.key_prefix.filter(|p| !p.trim().is_empty()),
        namespace,
        global_groups: raw.global_groups.unwrap_or(defaults.global_groups),
        non_persistent_groups: raw
            .non_persistent_groups
            .unwrap_or(defaults.non_persistent_groups),
        shared_segment: raw.shared_segment.unwrap_or(defaults.shared_segment),
        overlay_limit,
        overlay_max_age_seconds: raw
            .overlay_max_age_seconds
            .unwrap_or(defaults.overlay_max_age_seconds),
        default_ttl_seconds: raw
            .default_ttl_seconds
            .unwrap_or(defaults.default_ttl_seconds),
    })
}

fn parse_backend(name: &str) -> Option<BackendChoice> {
    match name.to_ascii_lowercase().as_str() {
        "auto" => Some(BackendChoice::Auto),
        "redis" => Some(BackendChoice::Redis),
        "memcached" | "memcache" => Some(BackendChoice::Memcached),
        "apcu" | "shared" => Some(BackendChoice::Shared),
        "memory" | "none" => Some(BackendChoice::Memory),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPageCacheSettings {
    root: Option<PathBuf>,
    ttl_seconds: Option<u64>,
    min_payload_bytes: Option<usize>,
    max_payload_bytes: Option<usize>,
    storable_content_types: Option<Vec<String>>,
    separate_mobile: Option<bool>,
    generation_marker: Option<bool>,
    site_hosts: Option<Vec<String>>,
    consume_immediately: Option<bool>,
    event_queue_limit: Option<usize>,
    consume_batch_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawObjectCacheSettings {
    enabled: Option<bool>,
    backend: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    database: Option<u8>,
    key_prefix: Option<String>,
    namespace: Option<String>,
    global_groups: Option<Vec<String>>,
    non_persistent_groups: Option<Vec<String>>,
    shared_segment: Option<String>,
    overlay_limit: Option<usize>,
    overlay_max_age_seconds: Option<u64>,
    default_ttl_seconds: Option<u64>,
}

#[cfg(test)]
mod tests;
