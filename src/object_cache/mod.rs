//! Object cache: a memcached-style key/value API over pluggable backends.
//!
//! Effective keys are `[prefix:]namespace:group:key`; global groups drop the
//! namespace and non-persistent groups never leave the process.
//!
//! ```toml
//! [object_cache]
//! backend = "auto"   # auto | redis | memcached | apcu | memory
//! host = "127.0.0.1"
//! ```

pub mod backend;
mod config;
mod facade;
mod keys;
mod overlay;

pub use backend::{BackendAdapter, BackendError, BackendKind, BackendStats, SetMode};
pub use config::{BackendChoice, ObjectCacheConfig};
pub use facade::{ObjectCache, ObjectCacheStats};
pub use keys::{DEFAULT_GROUP, effective_key};
