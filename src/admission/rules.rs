//! Exclusion rule sets: configuration shape, defaults and compiled form.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::context::RequestContext;
use super::matcher::{Cidr, MatchMode, Pattern, RuleError};

const DEFAULT_ROLES: &[&str] = &["administrator"];
const DEFAULT_COOKIES: &[&str] = &[
    "wordpress_logged_in_",
    "logged-in-session_",
    "comment_author_",
];
const DEFAULT_USER_AGENTS: &[&str] = &[
    "Googlebot",
    "bingbot",
    "Slurp",
    "DuckDuckBot",
    "Baiduspider",
    "YandexBot",
    "Applebot",
    "facebookexternalhit",
    "Twitterbot",
    "LinkedInBot",
    "Pinterestbot",
    "Slackbot",
];
const DEFAULT_QUERY_PARAMS: &[&str] = &["preview", "page_id", "preview_id", "s"];

/// Request attribute an exclusion rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Role,
    Cookie,
    UserAgent,
    QueryParam,
    Ip,
    Referrer,
}

impl Dimension {
    /// Evaluation order.
    pub const ALL: [Dimension; 6] = [
        Dimension::Role,
        Dimension::Cookie,
        Dimension::UserAgent,
        Dimension::QueryParam,
        Dimension::Ip,
        Dimension::Referrer,
    ];

    pub fn mode(self) -> MatchMode {
        match self {
            Self::Cookie => MatchMode::Prefix,
            Self::UserAgent | Self::Referrer => MatchMode::Substring,
            Self::Role | Self::QueryParam | Self::Ip => MatchMode::Exact,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Cookie => "cookie",
            Self::UserAgent => "user_agent",
            Self::QueryParam => "query_param",
            Self::Ip => "ip",
            Self::Referrer => "referrer",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub dimension: Dimension,
    pub pattern: String,
}

impl ExclusionRule {
    pub fn new(dimension: Dimension, pattern: impl Into<String>) -> Self {
        Self {
            dimension,
            pattern: pattern.into(),
        }
    }
}

/// Ordered pattern lists per dimension, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub roles: Vec<String>,
    pub cookies: Vec<String>,
    pub user_agents: Vec<String>,
    pub query_params: Vec<String>,
    pub ips: Vec<String>,
    pub referrers: Vec<String>,
}

impl RuleSet {
    /// Built-in exclusions.
    pub fn defaults() -> Self {
        let owned = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            roles: owned(DEFAULT_ROLES),
            cookies: owned(DEFAULT_COOKIES),
            user_agents: owned(DEFAULT_USER_AGENTS),
            query_params: owned(DEFAULT_QUERY_PARAMS),
            ips: Vec::new(),
            referrers: Vec::new(),
        }
    }

    /// Defaults first, then the user's patterns that are not already present.
    pub fn merged_with_defaults(user: &RuleSet) -> Self {
        let mut merged = Self::defaults();
        for dimension in Dimension::ALL {
            let target = merged.patterns_mut(dimension);
            for pattern in user.patterns(dimension) {
                if !target.contains(pattern) {
                    target.push(pattern.clone());
                }
            }
        }
        merged
    }

    pub fn patterns(&self, dimension: Dimension) -> &[String] {
        match dimension {
            Dimension::Role => &self.roles,
            Dimension::Cookie => &self.cookies,
            Dimension::UserAgent => &self.user_agents,
            Dimension::QueryParam => &self.query_params,
            Dimension::Ip => &self.ips,
            Dimension::Referrer => &self.referrers,
        }
    }

    fn patterns_mut(&mut self, dimension: Dimension) -> &mut Vec<String> {
        match dimension {
            Dimension::Role => &mut self.roles,
            Dimension::Cookie => &mut self.cookies,
            Dimension::UserAgent => &mut self.user_agents,
            Dimension::QueryParam => &mut self.query_params,
            Dimension::Ip => &mut self.ips,
            Dimension::Referrer => &mut self.referrers,
        }
    }

    pub fn push(&mut self, rule: ExclusionRule) {
        self.patterns_mut(rule.dimension).push(rule.pattern);
    }

    pub fn rules(&self) -> impl Iterator<Item = ExclusionRule> + '_ {
        Dimension::ALL.into_iter().flat_map(move |dimension| {
            self.patterns(dimension)
                .iter()
                .map(move |pattern| ExclusionRule::new(dimension, pattern.clone()))
        })
    }
}

/// What an unparsable rule does at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidRulePolicy {
    /// Skip the rule; other rules are still evaluated.
    #[default]
    FailOpen,
    /// Treat the rule's dimension as always matching.
    FailClosed,
}

/// A rule that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRule {
    pub rule: ExclusionRule,
    pub error: RuleError,
}

#[derive(Debug, Clone)]
enum Matcher {
    Text(Pattern),
    Range(Cidr),
}

/// Rule set with every pattern parsed, ready for per-request evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    matchers: Vec<(Dimension, Matcher)>,
    invalid: Vec<InvalidRule>,
    policy: InvalidRulePolicy,
}

impl CompiledRuleSet {
    pub fn compile(rules: &RuleSet, policy: InvalidRulePolicy) -> Self {
        let mut matchers = Vec::new();
        let mut invalid = Vec::new();

        for rule in rules.rules() {
            let compiled = match rule.dimension {
                Dimension::Ip => rule.pattern.parse::<Cidr>().map(Matcher::Range),
                Dimension::Role => {
                    Pattern::compile(&rule.pattern.to_ascii_lowercase(), MatchMode::Exact)
                        .map(Matcher::Text)
                }
                dimension => Pattern::compile(&rule.pattern, dimension.mode()).map(Matcher::Text),
            };

            match compiled {
                Ok(matcher) => matchers.push((rule.dimension, matcher)),
                Err(error) => {
                    warn!(
                        target = "admission::rules",
                        op = "compile",
                        dimension = %rule.dimension,
                        pattern = %rule.pattern,
                        policy = ?policy,
                        error = %error,
                        "Ignoring invalid exclusion rule"
                    );
                    invalid.push(InvalidRule { rule, error });
                }
            }
        }

        Self {
            matchers,
            invalid,
            policy,
        }
    }

    pub fn invalid_rules(&self) -> &[InvalidRule] {
        &self.invalid
    }

    /// First dimension (in [`Dimension::ALL`] order) with a matching rule.
    pub fn first_match(&self, context: &RequestContext) -> Option<Dimension> {
        Dimension::ALL
            .into_iter()
            .find(|dimension| self.matches(*dimension, context))
    }

    pub fn matches(&self, dimension: Dimension, context: &RequestContext) -> bool {
        if self.policy == InvalidRulePolicy::FailClosed
            && self
                .invalid
                .iter()
                .any(|invalid| invalid.rule.dimension == dimension)
        {
            return true;
        }

        self.matchers
            .iter()
            .filter(|(candidate, _)| *candidate == dimension)
            .any(|(_, matcher)| matcher_hits(dimension, matcher, context))
    }
}

fn matcher_hits(dimension: Dimension, matcher: &Matcher, context: &RequestContext) -> bool {
    match (dimension, matcher) {
        (Dimension::Ip, Matcher::Range(range)) => {
            context.client_ip.is_some_and(|ip| range.contains(ip))
        }
        (Dimension::Role, Matcher::Text(pattern)) => context
            .role
            .as_deref()
            .is_some_and(|role| pattern.matches(&role.to_ascii_lowercase())),
        (Dimension::Cookie, Matcher::Text(pattern)) => {
            context.cookies.keys().any(|name| pattern.matches(name))
        }
        (Dimension::UserAgent, Matcher::Text(pattern)) => context
            .user_agent
            .as_deref()
            .is_some_and(|ua| pattern.matches(ua)),
        (Dimension::QueryParam, Matcher::Text(pattern)) => {
            context.query.keys().any(|name| pattern.matches(name))
        }
        (Dimension::Referrer, Matcher::Text(pattern)) => context
            .referrer
            .as_deref()
            .is_some_and(|referrer| pattern.matches(referrer)),
        _ => false,
    }
}
