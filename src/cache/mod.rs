//! Full-page cache.
//!
//! - **Store**: sharded files under `page_cache.root`, one per URL variant
//! - **Engine**: admission, key building and response validation per request
//! - **Invalidation**: events are queued, merged into a plan and executed by
//!   the consumer, using dependencies recorded while pages rendered
//!
//! ```toml
//! [page_cache]
//! root = "cache/pages"
//! ttl_seconds = 3600
//! # ... see config.rs for all options
//! ```

pub mod clock;
mod config;
mod consumer;
pub mod deps;
mod engine;
mod events;
mod keys;
pub(crate) mod lock;
mod middleware;
mod planner;
mod registry;
mod stats;
mod store;
mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use consumer::{CacheConsumer, ConsumeReport};
pub use engine::{
    PageCacheEngine, PageCacheStats, RequestState, SkipReason, StoreOutcome, UrlResolver,
};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use keys::{
    EntityKey, Fingerprint, KeyError, OutputFormat, PageKey, Variant, build_key, normalize_path,
};
pub use middleware::{
    AuthenticatedRole, CACHE_STATUS_HEADER, CacheState, request_context, response_cache_layer,
};
pub use planner::ConsumptionPlan;
pub use registry::CacheRegistry;
pub use stats::{CacheStats, HitCounter};
pub use store::{PageStore, StoreError, StoreUsage, StoredPage};
pub use trigger::CacheTrigger;
