//! Admission: decides whether a request may be served from or stored in the page cache.
//!
//! Checks run in a fixed order (global toggle, authentication, method, query
//! string, request class, exclusion rules, override hooks) and the first
//! rejection wins.

mod config;
mod context;
mod engine;
mod matcher;
mod rules;

pub use config::AdmissionConfig;
pub use context::{DeviceClass, RequestContext, parse_cookie_header};
pub use engine::{
    Admission, AdmissionEngine, AdmissionOverride, AdmissionStats, OverrideVerdict, Rejection,
    RequestClass,
};
pub use matcher::{Cidr, MatchMode, Pattern, RuleError, ip_in_range, matches_literal_or_wildcard};
pub use rules::{
    CompiledRuleSet, Dimension, ExclusionRule, InvalidRule, InvalidRulePolicy, RuleSet,
};
