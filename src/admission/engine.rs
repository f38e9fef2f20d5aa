//! Admission engine: may this request be served from, or written to, the page cache?

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::http::Method;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::lock::{rw_read, rw_write};

use super::config::AdmissionConfig;
use super::context::RequestContext;
use super::matcher::{MatchMode, Pattern};
use super::rules::{CompiledRuleSet, Dimension, RuleSet};

const SOURCE: &str = "admission::engine";
const METRIC_ADMIT: &str = "sitecache_admission_admit_total";
const METRIC_REJECT: &str = "sitecache_admission_reject_total";

/// Request classes that are never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Admin,
    Ajax,
    Search,
    Feed,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    Disabled,
    LoggedIn,
    Method,
    QueryString,
    Context(RequestClass),
    Excluded(Dimension),
    Vetoed,
}

impl Rejection {
    const COUNT: usize = 15;

    fn index(self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::LoggedIn => 1,
            Self::Method => 2,
            Self::QueryString => 3,
            Self::Context(RequestClass::Admin) => 4,
            Self::Context(RequestClass::Ajax) => 5,
            Self::Context(RequestClass::Search) => 6,
            Self::Context(RequestClass::Feed) => 7,
            Self::Excluded(Dimension::Role) => 8,
            Self::Excluded(Dimension::Cookie) => 9,
            Self::Excluded(Dimension::UserAgent) => 10,
            Self::Excluded(Dimension::QueryParam) => 11,
            Self::Excluded(Dimension::Ip) => 12,
            Self::Excluded(Dimension::Referrer) => 13,
            Self::Vetoed => 14,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::LoggedIn => "logged_in",
            Self::Method => "method",
            Self::QueryString => "query_string",
            Self::Context(RequestClass::Admin) => "admin",
            Self::Context(RequestClass::Ajax) => "ajax",
            Self::Context(RequestClass::Search) => "search",
            Self::Context(RequestClass::Feed) => "feed",
            Self::Excluded(dimension) => match dimension {
                Dimension::Role => "excluded_role",
                Dimension::Cookie => "excluded_cookie",
                Dimension::UserAgent => "excluded_user_agent",
                Dimension::QueryParam => "excluded_query_param",
                Dimension::Ip => "excluded_ip",
                Dimension::Referrer => "excluded_referrer",
            },
            Self::Vetoed => "vetoed",
        }
    }

    const ALL: [Rejection; Rejection::COUNT] = [
        Self::Disabled,
        Self::LoggedIn,
        Self::Method,
        Self::QueryString,
        Self::Context(RequestClass::Admin),
        Self::Context(RequestClass::Ajax),
        Self::Context(RequestClass::Search),
        Self::Context(RequestClass::Feed),
        Self::Excluded(Dimension::Role),
        Self::Excluded(Dimension::Cookie),
        Self::Excluded(Dimension::UserAgent),
        Self::Excluded(Dimension::QueryParam),
        Self::Excluded(Dimension::Ip),
        Self::Excluded(Dimension::Referrer),
        Self::Vetoed,
    ];

    /// Guards that no override may lift.
    pub fn is_hard(self) -> bool {
        matches!(self, Self::Disabled | Self::LoggedIn | Self::Method)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Cacheable,
    NotCacheable(Rejection),
}

impl Admission {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Cacheable)
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Cacheable => None,
            Self::NotCacheable(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideVerdict {
    Veto,
    Allow,
}

/// Hook for collaborators (shop carts, membership areas) to have the final say.
///
/// Evaluated after every built-in check. `Veto` always wins over `Allow`.
pub trait AdmissionOverride: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, context: &RequestContext, current: Admission) -> Option<OverrideVerdict>;
}

/// Admitted/rejected counters, exported for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub rejected: BTreeMap<&'static str, u64>,
}

struct Counters {
    admitted: AtomicU64,
    rejected: [AtomicU64; Rejection::COUNT],
}

impl Counters {
    fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

pub struct AdmissionEngine {
    config: AdmissionConfig,
    rules: CompiledRuleSet,
    session_cookies: Vec<Pattern>,
    ignored_params: Vec<Pattern>,
    key_params: Vec<Pattern>,
    overrides: RwLock<Vec<Arc<dyn AdmissionOverride>>>,
    counters: Counters,
}

impl AdmissionEngine {
    pub fn new(config: AdmissionConfig) -> Self {
        let mut rules = RuleSet::merged_with_defaults(&config.rules);
        if config.cache_logged_in {
            // Logged-in pages are partitioned by role instead of excluded by cookie.
            rules
                .cookies
                .retain(|pattern| !config.session_cookie_prefixes.contains(pattern));
        }
        let rules = CompiledRuleSet::compile(&rules, config.invalid_rule_policy);

        Self {
            session_cookies: compile_all(&config.session_cookie_prefixes, MatchMode::Prefix),
            ignored_params: compile_all(&config.ignored_query_params, MatchMode::Exact),
            key_params: compile_all(&config.cacheable_query_params, MatchMode::Exact),
            rules,
            config,
            overrides: RwLock::new(Vec::new()),
            counters: Counters::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn rules(&self) -> &CompiledRuleSet {
        &self.rules
    }

    /// Register a final-say hook.
    pub fn register_override(&self, hook: Arc<dyn AdmissionOverride>) {
        rw_write(&self.overrides, SOURCE, "register_override").push(hook);
    }

    pub fn is_cacheable(&self, context: &RequestContext) -> bool {
        self.evaluate(context).is_cacheable()
    }

    /// Run every check in order and record the outcome.
    pub fn evaluate(&self, context: &RequestContext) -> Admission {
        let mut admission = self.builtin_checks(context);

        let hard_rejection = admission.rejection().is_some_and(Rejection::is_hard);
        if !hard_rejection {
            admission = self.apply_overrides(context, admission);
        }

        self.record(admission);
        debug!(
            host = %context.host,
            path = %context.path,
            outcome = admission.rejection().map(Rejection::label).unwrap_or("cacheable"),
            "admission evaluated"
        );
        admission
    }

    fn builtin_checks(&self, context: &RequestContext) -> Admission {
        use Admission::NotCacheable;

        if !self.config.enabled {
            return NotCacheable(Rejection::Disabled);
        }

        if self.is_logged_in(context) {
            // With logged-in caching the role becomes part of the key; without a role
            // there is nothing to partition on.
            if !self.config.cache_logged_in || context.role.is_none() {
                return NotCacheable(Rejection::LoggedIn);
            }
        }

        if context.method != Method::GET && context.method != Method::HEAD {
            return NotCacheable(Rejection::Method);
        }

        if context
            .query
            .keys()
            .any(|name| !self.is_ignored_param(name) && !self.is_key_param(name))
        {
            return NotCacheable(Rejection::QueryString);
        }

        if let Some(class) = self.classify(context) {
            return NotCacheable(Rejection::Context(class));
        }

        match self.rules.first_match(context) {
            Some(dimension) => NotCacheable(Rejection::Excluded(dimension)),
            None => Admission::Cacheable,
        }
    }

    fn apply_overrides(&self, context: &RequestContext, current: Admission) -> Admission {
        let overrides = rw_read(&self.overrides, SOURCE, "apply_overrides");
        let mut allowed_by = None;
        for hook in overrides.iter() {
            match hook.evaluate(context, current) {
                Some(OverrideVerdict::Veto) => {
                    debug!(hook = hook.name(), "admission vetoed by override");
                    return Admission::NotCacheable(Rejection::Vetoed);
                }
                Some(OverrideVerdict::Allow) => {
                    allowed_by.get_or_insert_with(|| hook.name().to_string());
                }
                None => {}
            }
        }

        match (current, allowed_by) {
            (Admission::NotCacheable(reason), Some(hook)) => {
                warn!(
                    target = "admission::engine",
                    op = "apply_overrides",
                    hook = %hook,
                    lifted = reason.label(),
                    path = %context.path,
                    "Override force-allowed a rejected request"
                );
                Admission::Cacheable
            }
            (current, _) => current,
        }
    }

    fn is_logged_in(&self, context: &RequestContext) -> bool {
        context.role.is_some()
            || context
                .cookies
                .keys()
                .any(|name| self.session_cookies.iter().any(|p| p.matches(name)))
    }

    fn classify(&self, context: &RequestContext) -> Option<RequestClass> {
        let path = context.path.as_str();
        if self
            .config
            .excluded_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Some(RequestClass::Admin);
        }
        if context.ajax
            || self
                .config
                .ajax_path_markers
                .iter()
                .any(|marker| path.contains(marker.as_str()))
        {
            return Some(RequestClass::Ajax);
        }
        if context.query.contains_key(&self.config.search_query_param)
            || self
                .config
                .search_path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Some(RequestClass::Search);
        }
        let trimmed = path.trim_end_matches('/');
        if !self.config.cache_feeds
            && self
                .config
                .feed_suffixes
                .iter()
                .any(|suffix| trimmed.ends_with(suffix.as_str()))
        {
            return Some(RequestClass::Feed);
        }
        None
    }

    fn is_ignored_param(&self, name: &str) -> bool {
        self.ignored_params.iter().any(|p| p.matches(name))
    }

    /// Whether a query parameter is part of the cache key.
    pub fn is_key_param(&self, name: &str) -> bool {
        self.key_params.iter().any(|p| p.matches(name))
    }

    fn record(&self, admission: Admission) {
        match admission {
            Admission::Cacheable => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_ADMIT).increment(1);
            }
            Admission::NotCacheable(reason) => {
                self.counters.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_REJECT, "reason" => reason.label()).increment(1);
            }
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let rejected = Rejection::ALL
            .into_iter()
            .filter_map(|reason| {
                let count = self.counters.rejected[reason.index()].load(Ordering::Relaxed);
                (count > 0).then_some((reason.label(), count))
            })
            .collect();
        AdmissionStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected,
        }
    }

    pub fn reset_stats(&self) {
        self.counters.admitted.store(0, Ordering::Relaxed);
        for counter in &self.counters.rejected {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn compile_all(patterns: &[String], mode: MatchMode) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|pattern| match Pattern::compile(pattern, mode) {
            Ok(compiled) => Some(compiled),
            Err(error) => {
                warn!(
                    target = "admission::engine",
                    op = "compile",
                    pattern = %pattern,
                    error = %error,
                    "Ignoring invalid admission pattern"
                );
                None
            }
        })
        .collect()
}
