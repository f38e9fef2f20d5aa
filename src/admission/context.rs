//! Per-request facts consumed by admission and key building.

use std::collections::BTreeMap;
use std::net::IpAddr;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

const MOBILE_TOKENS: &[&str] = &[
    "Mobile",
    "Android",
    "iPhone",
    "iPod",
    "BlackBerry",
    "Opera Mini",
    "IEMobile",
    "Windows Phone",
    "webOS",
    "Kindle",
    "Silk/",
];

/// Device partition of the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

impl DeviceClass {
    /// Classify a user agent. Tablets that do not advertise `Mobile` stay on desktop.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        match user_agent {
            Some(ua) if MOBILE_TOKENS.iter().any(|token| ua.contains(token)) => Self::Mobile,
            _ => Self::Desktop,
        }
    }

    pub fn is_mobile(self) -> bool {
        matches!(self, Self::Mobile)
    }
}

/// Immutable view of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub host: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub method: Method,
    pub cookies: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub referrer: Option<String>,
    /// Role of the authenticated user, if any.
    pub role: Option<String>,
    pub device: DeviceClass,
    /// `X-Requested-With: XMLHttpRequest`.
    pub ajax: bool,
}

impl RequestContext {
    /// Anonymous desktop `GET` with no cookies or query string.
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            query: BTreeMap::new(),
            method: Method::GET,
            cookies: BTreeMap::new(),
            user_agent: None,
            client_ip: None,
            referrer: None,
            role: None,
            device: DeviceClass::Desktop,
            ajax: false,
        }
    }

    /// Build a context from an absolute URL. Returns `None` for URLs without a host.
    pub fn from_url(method: Method, url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = match parsed.port() {
            Some(port) => format!("{}:{port}", parsed.host_str()?),
            None => parsed.host_str()?.to_string(),
        };
        let mut context = Self::get(host, parsed.path());
        context.method = method;
        context.query = parsed.query_pairs().into_owned().collect();
        Some(context)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Sets the user agent and re-derives the device class from it.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        self.device = DeviceClass::from_user_agent(Some(&user_agent));
        self.user_agent = Some(user_agent);
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    pub fn with_ajax(mut self, ajax: bool) -> Self {
        self.ajax = ajax;
        self
    }
}

/// Parse a `Cookie` request header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
                None => Some((pair.to_string(), String::new())),
            }
        })
        .collect()
}
