//! Pure predicates behind the exclusion rules.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// How a pattern without `*` is compared against a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Value starts with the pattern (cookie names).
    Prefix,
    /// Value contains the pattern, ignoring ASCII case (user agents, referrers).
    Substring,
    /// Whole-value equality (roles, query parameter names).
    Exact,
}

impl MatchMode {
    pub fn folds_case(self) -> bool {
        matches!(self, Self::Substring)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid wildcard pattern `{pattern}`: {reason}")]
    Wildcard { pattern: String, reason: String },
    #[error("invalid CIDR `{cidr}`: {reason}")]
    Cidr { cidr: String, reason: String },
    #[error("empty pattern")]
    Empty,
}

/// Literal or wildcard pattern, compiled once.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal { text: String, mode: MatchMode },
    Wildcard { source: String, regex: Regex },
}

impl Pattern {
    pub fn compile(pattern: &str, mode: MatchMode) -> Result<Self, RuleError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RuleError::Empty);
        }
        if !pattern.contains('*') {
            let text = if mode.folds_case() {
                pattern.to_ascii_lowercase()
            } else {
                pattern.to_string()
            };
            return Ok(Self::Literal { text, mode });
        }

        let anchored = format!(
            "^{}$",
            pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*")
        );
        let regex = RegexBuilder::new(&anchored)
            .case_insensitive(mode.folds_case())
            .build()
            .map_err(|err| RuleError::Wildcard {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self::Wildcard {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Literal { text, mode } => match mode {
                MatchMode::Prefix => value.starts_with(text.as_str()),
                MatchMode::Substring => value.to_ascii_lowercase().contains(text.as_str()),
                MatchMode::Exact => value == text,
            },
            Self::Wildcard { regex, .. } => regex.is_match(value),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal { text, .. } => text,
            Self::Wildcard { source, .. } => source,
        }
    }
}

/// Match a literal or `*` wildcard pattern against a value.
///
/// A pattern that fails to compile never matches.
pub fn matches_literal_or_wildcard(pattern: &str, value: &str, mode: MatchMode) -> bool {
    Pattern::compile(pattern, mode)
        .map(|compiled| compiled.matches(value))
        .unwrap_or(false)
}

/// An address range in `subnet/prefix` form. A bare address is a single-host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4 { network: u32, mask: u32 },
    V6 { network: u128, mask: u128 },
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { network, mask }, IpAddr::V4(addr)) => u32::from(addr) & mask == *network,
            (Self::V6 { network, mask }, IpAddr::V6(addr)) => u128::from(addr) & mask == *network,
            (Self::V6 { network, mask }, IpAddr::V4(addr)) => {
                u128::from(addr.to_ipv6_mapped()) & mask == *network
            }
            (Self::V4 { .. }, IpAddr::V6(_)) => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = RuleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RuleError::Cidr {
            cidr: raw.to_string(),
            reason: reason.to_string(),
        };

        let (address, prefix) = match raw.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (raw.trim(), None),
        };
        let address: IpAddr = address
            .parse()
            .map_err(|_| invalid("address does not parse"))?;
        let prefix = match prefix {
            Some(prefix) => Some(
                prefix
                    .parse::<u32>()
                    .map_err(|_| invalid("prefix length is not a number"))?,
            ),
            None => None,
        };

        match address {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(invalid("prefix length exceeds 32"));
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - prefix)
                };
                Ok(Self::V4 {
                    network: u32::from(v4) & mask,
                    mask,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(invalid("prefix length exceeds 128"));
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                Ok(Self::V6 {
                    network: u128::from(v6) & mask,
                    mask,
                })
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 { network, mask } => write!(
                f,
                "{}/{}",
                std::net::Ipv4Addr::from(*network),
                mask.count_ones()
            ),
            Self::V6 { network, mask } => write!(
                f,
                "{}/{}",
                std::net::Ipv6Addr::from(*network),
                mask.count_ones()
            ),
        }
    }
}

/// `true` when `ip` falls inside `cidr`. Unparsable input never matches.
pub fn ip_in_range(ip: &str, cidr: &str) -> bool {
    let Ok(address) = ip.trim().parse::<IpAddr>() else {
        return false;
    };
    cidr.parse::<Cidr>()
        .map(|range| range.contains(address))
        .unwrap_or(false)
}
