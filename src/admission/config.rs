//! Admission configuration.

use serde::{Deserialize, Serialize};

use super::rules::{InvalidRulePolicy, RuleSet};

const DEFAULT_SESSION_COOKIE_PREFIXES: &[&str] = &["wordpress_logged_in_", "logged-in-session_"];
const DEFAULT_IGNORED_QUERY_PARAMS: &[&str] = &[
    "utm_*",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "_ga",
    "ref",
];
const DEFAULT_EXCLUDED_PATH_PREFIXES: &[&str] = &[
    "/wp-admin",
    "/wp-login.php",
    "/admin",
    "/xmlrpc.php",
    "/wp-cron.php",
];
const DEFAULT_AJAX_PATH_MARKERS: &[&str] = &["admin-ajax.php", "/wp-json/"];
const DEFAULT_SEARCH_QUERY_PARAM: &str = "s";
const DEFAULT_SEARCH_PATH_PREFIXES: &[&str] = &["/search/"];
const DEFAULT_FEED_SUFFIXES: &[&str] = &["/feed", ".rss", ".atom", "/rss.xml", "/atom.xml"];

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Everything the admission engine needs, passed at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Global page cache toggle.
    pub enabled: bool,
    /// Cache pages for authenticated users, partitioned by role.
    pub cache_logged_in: bool,
    /// Cookie name prefixes that mark a logged-in session.
    pub session_cookie_prefixes: Vec<String>,
    /// Query parameters that never block caching and are dropped from the key.
    pub ignored_query_params: Vec<String>,
    /// Query parameters that never block caching and are kept in the key.
    pub cacheable_query_params: Vec<String>,
    pub excluded_path_prefixes: Vec<String>,
    pub ajax_path_markers: Vec<String>,
    pub search_query_param: String,
    pub search_path_prefixes: Vec<String>,
    pub cache_feeds: bool,
    pub feed_suffixes: Vec<String>,
    /// User exclusions, merged with the built-in defaults.
    pub rules: RuleSet,
    pub invalid_rule_policy: InvalidRulePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_logged_in: false,
            session_cookie_prefixes: owned(DEFAULT_SESSION_COOKIE_PREFIXES),
            ignored_query_params: owned(DEFAULT_IGNORED_QUERY_PARAMS),
            cacheable_query_params: Vec::new(),
            excluded_path_prefixes: owned(DEFAULT_EXCLUDED_PATH_PREFIXES),
            ajax_path_markers: owned(DEFAULT_AJAX_PATH_MARKERS),
            search_query_param: DEFAULT_SEARCH_QUERY_PARAM.to_string(),
            search_path_prefixes: owned(DEFAULT_SEARCH_PATH_PREFIXES),
            cache_feeds: false,
            feed_suffixes: owned(DEFAULT_FEED_SUFFIXES),
            rules: RuleSet::default(),
            invalid_rule_policy: InvalidRulePolicy::default(),
        }
    }
}
