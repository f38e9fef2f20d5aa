//! sitecache: website acceleration primitives.
//!
//! - [`admission`] decides whether a request may be served from or written to the page cache.
//! - [`cache`] is the full-response page cache: fingerprinting, the sharded on-disk store,
//!   dependency-driven invalidation and the axum interception layer.
//! - [`object_cache`] is a backend-agnostic key/value cache with Redis, Memcached,
//!   shared-memory and in-process adapters.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod object_cache;
