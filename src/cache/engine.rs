//! Page cache engine.
//!
//! Orchestrates admission, key building, the on-disk store and the
//! dependency registry around one request/response cycle.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::{HeaderMap, StatusCode, header};
use bytes::{Bytes, BytesMut};
use metrics::counter;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::admission::{
    Admission, AdmissionEngine, AdmissionStats, DeviceClass, Rejection, RequestContext,
};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::keys::{EntityKey, Fingerprint, KeyError, OutputFormat, PageKey, Variant, normalize_path};
use super::registry::CacheRegistry;
use super::stats::{CacheStats, HitCounter};
use super::store::{PageStore, StoreError, StoreUsage, StoredPage};

const METRIC_PAGE_HIT: &str = "sitecache_page_hit_total";
const METRIC_PAGE_MISS: &str = "sitecache_page_miss_total";
const METRIC_PAGE_STORE: &str = "sitecache_page_store_total";

/// Maps a changed entity to the public URLs that display it (permalink,
/// archives, feeds) beyond what dependency tracking recorded.
pub trait UrlResolver: Send + Sync {
    fn urls_for(&self, entity: &EntityKey) -> Vec<String>;
}

/// Decided once per request, before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Cacheable {
        key: PageKey,
        fingerprint: Fingerprint,
    },
    NotCacheable(Rejection),
}

/// Why a rendered response was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Status,
    Redirect,
    SetCookie,
    ContentType,
    TooSmall,
    TooLarge,
    WriteFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Redirect => "redirect",
            Self::SetCookie => "set_cookie",
            Self::ContentType => "content_type",
            Self::TooSmall => "too_small",
            Self::TooLarge => "too_large",
            Self::WriteFailed => "write_failed",
        }
    }
}

/// Result of [`PageCacheEngine::finish`]; both arms carry the bytes to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored; the body is exactly what later hits will serve.
    Stored(Bytes),
    Skipped(SkipReason, Bytes),
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored(_))
    }

    pub fn into_body(self) -> Bytes {
        match self {
            Self::Stored(body) | Self::Skipped(_, body) => body,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageCacheStats {
    pub lookups: CacheStats,
    pub stored: u64,
    pub tracked_pages: usize,
    pub admission: AdmissionStats,
}

pub struct PageCacheEngine {
    config: CacheConfig,
    admission: Arc<AdmissionEngine>,
    store: PageStore,
    registry: CacheRegistry,
    resolver: Option<Arc<dyn UrlResolver>>,
    lookups: HitCounter,
    stored: AtomicU64,
}

impl PageCacheEngine {
    pub fn new(config: CacheConfig, admission: Arc<AdmissionEngine>) -> Self {
        Self::with_clock(config, admission, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        admission: Arc<AdmissionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: PageStore::with_clock(config.root.clone(), clock),
            config,
            admission,
            registry: CacheRegistry::new(),
            resolver: None,
            lookups: HitCounter::new(),
            stored: AtomicU64::new(0),
        }
    }

    pub fn with_url_resolver(mut self, resolver: Arc<dyn UrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionEngine {
        &self.admission
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    /// Run admission and, if the request is cacheable, compute its key.
    pub fn begin(&self, context: &RequestContext, format: OutputFormat) -> RequestState {
        match self.admission.evaluate(context) {
            Admission::NotCacheable(reason) => RequestState::NotCacheable(reason),
            Admission::Cacheable => {
                let key = self.page_key(context);
                let fingerprint = key.fingerprint(&self.variant(context)).with_format(format);
                RequestState::Cacheable { key, fingerprint }
            }
        }
    }

    fn page_key(&self, context: &RequestContext) -> PageKey {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(context.query.iter())
            .finish();
        let path = normalize_path(&format!("{}?{query}", context.path), |name| {
            self.admission.is_key_param(name)
        });
        PageKey::new(&context.host, &path)
    }

    fn variant(&self, context: &RequestContext) -> Variant {
        let device = if self.config.separate_mobile {
            context.device
        } else {
            DeviceClass::Desktop
        };
        let role = if self.admission.config().cache_logged_in {
            context.role.clone()
        } else {
            None
        };
        Variant::new(device, role)
    }

    /// Read a fresh entry and count the hit or miss.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<StoredPage> {
        let page = self.store.get(fingerprint);
        if page.is_some() {
            self.lookups.record_hit();
            counter!(METRIC_PAGE_HIT).increment(1);
        } else {
            self.lookups.record_miss();
            counter!(METRIC_PAGE_MISS).increment(1);
        }
        page
    }

    /// Validate a rendered response and store it.
    pub fn finish(
        &self,
        key: &PageKey,
        fingerprint: &Fingerprint,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        deps: HashSet<EntityKey>,
    ) -> StoreOutcome {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if let Some(reason) = self.reject_response(status, headers, &content_type, body.len()) {
            debug!(
                cache = "page",
                outcome = "skip",
                reason = reason.as_str(),
                page = %key,
                "response not stored"
            );
            return StoreOutcome::Skipped(reason, body);
        }

        let payload = if self.config.generation_marker && is_html(&content_type) {
            self.with_marker(&body)
        } else {
            body.clone()
        };

        if let Err(err) = self.store.record_dependencies(key, &deps) {
            warn!(
                target = "cache::engine",
                op = "record_dependencies",
                result = "error",
                page = %key,
                error = %err,
                "Failed to record page dependencies"
            );
        }

        if !self
            .store
            .put(fingerprint, &payload, &content_type, self.config.ttl_seconds)
        {
            return StoreOutcome::Skipped(SkipReason::WriteFailed, body);
        }

        debug!(
            cache = "page",
            outcome = "stored",
            page = %key,
            fingerprint = %fingerprint,
            deps_count = deps.len(),
            "page stored"
        );
        self.registry.register(key.clone(), deps);
        self.stored.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_PAGE_STORE).increment(1);
        StoreOutcome::Stored(payload)
    }

    fn reject_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        content_type: &str,
        len: usize,
    ) -> Option<SkipReason> {
        if status.is_redirection() || headers.contains_key(header::LOCATION) {
            return Some(SkipReason::Redirect);
        }
        if status != StatusCode::OK {
            return Some(SkipReason::Status);
        }
        if headers.contains_key(header::SET_COOKIE) {
            return Some(SkipReason::SetCookie);
        }
        if !self.config.is_storable_content_type(content_type) {
            return Some(SkipReason::ContentType);
        }
        if len <= self.config.min_payload_bytes {
            return Some(SkipReason::TooSmall);
        }
        if len > self.config.max_payload_bytes {
            return Some(SkipReason::TooLarge);
        }
        None
    }

    fn with_marker(&self, body: &Bytes) -> Bytes {
        let now = self.store.now();
        let stamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let marker = format!("\n<!-- Cached page generated by sitecache on {stamp} -->");
        let mut payload = BytesMut::with_capacity(body.len() + marker.len());
        payload.extend_from_slice(body);
        payload.extend_from_slice(marker.as_bytes());
        payload.freeze()
    }

    /// Invalidate every page showing `entity`, plus the front page of each affected host.
    pub fn invalidate_entity(&self, entity: &EntityKey) -> usize {
        let mut pages: BTreeSet<PageKey> =
            self.registry.pages_for_entity(entity).into_iter().collect();
        pages.extend(self.take_dependents(entity));

        if let Some(resolver) = &self.resolver {
            for url in resolver.urls_for(entity) {
                match PageKey::from_url(&url, |name| self.admission.is_key_param(name)) {
                    Ok(page) => {
                        pages.insert(page);
                    }
                    Err(err) => warn!(
                        target = "cache::engine",
                        op = "invalidate_entity",
                        entity = %entity,
                        url = %url,
                        error = %err,
                        "Ignoring unresolvable URL"
                    ),
                }
            }
        }

        let hosts: BTreeSet<String> = pages
            .iter()
            .map(|page| page.host().to_string())
            .chain(self.config.site_hosts.iter().map(|host| host.to_ascii_lowercase()))
            .collect();
        pages.extend(hosts.iter().map(|host| PageKey::root(host)));

        let removed: usize = pages.iter().map(|page| self.invalidate_page(page)).sum();
        info!(
            cache = "page",
            entity = %entity,
            pages = pages.len(),
            removed,
            "entity invalidated"
        );
        removed
    }

    /// Drop a deleted entity from dependency tracking.
    pub fn forget_entity(&self, entity: &EntityKey) {
        self.registry.unregister_entity(entity);
        self.take_dependents(entity);
    }

    /// Pages recorded on disk as depending on `entity`, by any engine on this root.
    fn take_dependents(&self, entity: &EntityKey) -> HashSet<PageKey> {
        self.store.take_dependents(entity).unwrap_or_else(|err| {
            warn!(
                target = "cache::engine",
                op = "take_dependents",
                result = "error",
                entity = %entity,
                error = %err,
                "Failed to read dependency index"
            );
            HashSet::new()
        })
    }

    /// Remove every stored variant of one page.
    pub fn invalidate_page(&self, page: &PageKey) -> usize {
        self.registry.unregister(page);
        match self.store.invalidate(&page.fingerprint(&Variant::default())) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(
                    target = "cache::engine",
                    op = "invalidate_page",
                    page = %page,
                    error = %err,
                    "Failed to invalidate page"
                );
                0
            }
        }
    }

    /// Invalidate the page behind an absolute URL.
    pub fn purge_url(&self, url: &str) -> Result<usize, KeyError> {
        let page = PageKey::from_url(url, |name| self.admission.is_key_param(name))?;
        Ok(self.invalidate_page(&page))
    }

    pub fn invalidate_all(&self) -> usize {
        self.registry.clear();
        match self.store.invalidate_all() {
            Ok(removed) => {
                info!(cache = "page", removed, "page cache cleared");
                removed
            }
            Err(err) => {
                warn!(
                    target = "cache::engine",
                    op = "invalidate_all",
                    error = %err,
                    "Failed to clear page cache"
                );
                0
            }
        }
    }

    /// Garbage-collect stale entries.
    pub fn prune(&self) -> Result<usize, StoreError> {
        self.store.sweep_expired()
    }

    pub fn usage(&self) -> Result<StoreUsage, StoreError> {
        self.store.usage()
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            lookups: self.lookups.snapshot(),
            stored: self.stored.load(Ordering::Relaxed),
            tracked_pages: self.registry.page_count(),
            admission: self.admission.stats(),
        }
    }

    pub fn reset_stats(&self) {
        self.lookups.reset();
        self.stored.store(0, Ordering::Relaxed);
        self.admission.reset_stats();
    }
}

fn is_html(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("text/html") || essence.eq_ignore_ascii_case("application/xhtml+xml")
}
