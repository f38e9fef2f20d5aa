use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the sitecache operator tool.
#[derive(Debug, Parser)]
#[command(
    name = "sitecache",
    version,
    about = "Inspect and maintain the sitecache page and object caches"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SITECACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Remove every stored variant of one URL.
    #[command(name = "purge-url")]
    PurgeUrl(PurgeUrlArgs),
    /// Invalidate the pages that depend on a changed content item or term.
    Invalidate(InvalidateArgs),
    /// Remove every stored page.
    #[command(name = "purge-all")]
    PurgeAll,
    /// Delete stale entries from the page store.
    Prune,
    /// Print page store usage and object cache statistics as JSON.
    Stats,
    /// Dry-run admission and fingerprinting for a URL.
    Check(CheckArgs),
    /// Report which object cache backend would be selected.
    Probe,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeUrlArgs {
    /// Absolute URL, e.g. `https://example.com/blog/hello-world`.
    #[arg(value_name = "URL")]
    pub url: String,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    /// Content item id, or term id with `--term`.
    #[arg(value_name = "ID")]
    pub id: u64,

    /// Treat the id as a taxonomy term.
    #[arg(long)]
    pub term: bool,

    /// The content item was deleted rather than updated.
    #[arg(long, conflicts_with = "term")]
    pub deleted: bool,
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    /// Absolute URL to evaluate.
    #[arg(value_name = "URL")]
    pub url: String,

    /// HTTP method of the simulated request.
    #[arg(long, default_value = "GET")]
    pub method: String,

    /// Request cookie as `name=value`; may be repeated.
    #[arg(long = "cookie", value_name = "NAME=VALUE")]
    pub cookies: Vec<String>,

    #[arg(long = "user-agent", value_name = "UA")]
    pub user_agent: Option<String>,

    #[arg(long = "referrer", value_name = "URL")]
    pub referrer: Option<String>,

    #[arg(long = "ip", value_name = "ADDR")]
    pub client_ip: Option<IpAddr>,

    /// Role of the signed-in user.
    #[arg(long, value_name = "ROLE")]
    pub role: Option<String>,

    /// Simulate an `X-Requested-With: XMLHttpRequest` request.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub ajax: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Auto,
    Redis,
    Memcached,
    Apcu,
    Memory,
}

impl BackendArg {
    pub fn as_config_value(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Redis => "redis",
            Self::Memcached => "memcached",
            Self::Apcu => "apcu",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the page store directory.
    #[arg(long = "cache-root", value_name = "PATH", value_hint = ValueHint::DirPath, global = true)]
    pub cache_root: Option<PathBuf>,

    /// Override the page lifetime.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS", global = true)]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the object cache backend.
    #[arg(long = "object-cache-backend", value_enum, global = true)]
    pub object_cache_backend: Option<BackendArg>,

    /// Override the object cache server host.
    #[arg(long = "object-cache-host", value_name = "HOST", global = true)]
    pub object_cache_host: Option<String>,

    /// Override the object cache server port.
    #[arg(long = "object-cache-port", value_name = "PORT", global = true)]
    pub object_cache_port: Option<u16>,
}
