//! Page cache key definitions.
//!
//! `PageKey` names a cacheable URL, `Fingerprint` names its files on disk and
//! `EntityKey` names the content a page was rendered from.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::{Url, form_urlencoded};

use crate::admission::DeviceClass;

const HASH_HEX_LEN: usize = 32;

/// Identifies a piece of site content for dependency tracking.
///
/// When it changes, every page that recorded it must be invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// A post, page or other content item by id.
    Content(u64),
    /// A taxonomy term (category, tag) by id.
    Term(u64),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content(id) => write!(f, "content:{id}"),
            Self::Term(id) => write!(f, "term:{id}"),
        }
    }
}

/// Payload format, which selects the entry file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    #[default]
    Html,
    Xml,
    Json,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [Self::Html, Self::Xml, Self::Json];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Xml => "xml",
            Self::Json => "json",
        }
    }

    /// Guess the format from a request path and its `Accept` header.
    pub fn detect(path: &str, accept: Option<&str>) -> Self {
        let trimmed = path.trim_end_matches('/');
        if trimmed.ends_with(".xml")
            || trimmed.ends_with(".rss")
            || trimmed.ends_with(".atom")
            || trimmed.ends_with("/feed")
        {
            Self::Xml
        } else if trimmed.ends_with(".json")
            || accept.is_some_and(|value| value.contains("application/json"))
        {
            Self::Json
        } else {
            Self::Html
        }
    }
}

/// Device and role partition of a cached page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Variant {
    pub device: DeviceClass,
    pub role: Option<String>,
}

impl Variant {
    pub fn new(device: DeviceClass, role: Option<String>) -> Self {
        Self { device, role }
    }

    pub fn mobile() -> Self {
        Self::new(DeviceClass::Mobile, None)
    }

    /// File name suffix, empty for anonymous desktop pages.
    pub fn suffix(&self) -> String {
        let mut suffix = String::new();
        if self.device.is_mobile() {
            suffix.push_str("-mobile");
        }
        if let Some(role) = &self.role {
            suffix.push_str("-role-");
            suffix.push_str(&sanitize_role(role));
        }
        suffix
    }
}

fn sanitize_role(role: &str) -> String {
    role.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("fingerprint hash `{0}` is not {HASH_HEX_LEN} lowercase hex characters")]
    InvalidHash(String),
    #[error("url `{0}` cannot be cached")]
    InvalidUrl(String),
}

/// On-disk identity of a cached page: content hash, variant suffix and format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    hash: String,
    suffix: String,
    format: OutputFormat,
}

impl Fingerprint {
    /// A fingerprint for an existing hash, e.g. one given on the command line.
    pub fn from_hash(hash: &str) -> Result<Self, KeyError> {
        if !is_valid_hash(hash) {
            return Err(KeyError::InvalidHash(hash.to_string()));
        }
        Ok(Self {
            hash: hash.to_string(),
            suffix: String::new(),
            format: OutputFormat::Html,
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Two leading hex characters, naming the shard directory.
    pub fn bucket(&self) -> &str {
        &self.hash[..2]
    }

    pub fn file_name(&self) -> String {
        format!("{}{}.{}", self.hash, self.suffix, self.format.extension())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.hash, self.suffix)
    }
}

pub(crate) fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Build the fingerprint for a normalized `(host, path)` pair and a variant.
pub fn build_key(host: &str, path: &str, variant: &Variant) -> Fingerprint {
    Fingerprint {
        hash: hash_page(&host.to_ascii_lowercase(), path),
        suffix: variant.suffix(),
        format: OutputFormat::Html,
    }
}

/// SHA-256 of `host ++ path`, truncated to 128 bits.
fn hash_page(host: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..HASH_HEX_LEN / 2])
}

/// Drop the fragment and every query parameter `keep` rejects; the rest is sorted.
pub fn normalize_path(path_and_query: &str, keep: impl Fn(&str) -> bool) -> String {
    let without_fragment = path_and_query
        .split_once('#')
        .map_or(path_and_query, |(head, _)| head);
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    let mut pairs: Vec<(String, String)> = query
        .map(|query| {
            form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .filter(|(name, _)| keep(name))
                .collect()
        })
        .unwrap_or_default();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort();
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{path}?{query}")
}

/// A cacheable URL: lowercase host plus normalized path.
///
/// All variants of one URL share the same fingerprint hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    host: String,
    path: String,
}

impl PageKey {
    /// `path` must already be normalized (see [`normalize_path`]).
    pub fn new(host: &str, path: &str) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
        }
    }

    pub fn root(host: &str) -> Self {
        Self::new(host, "/")
    }

    /// Parse an absolute URL, keeping only the query parameters `keep` accepts.
    pub fn from_url(url: &str, keep: impl Fn(&str) -> bool) -> Result<Self, KeyError> {
        let parsed = Url::parse(url).map_err(|_| KeyError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| KeyError::InvalidUrl(url.to_string()))?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path_and_query = match parsed.query() {
            Some(query) => format!("{}?{query}", parsed.path()),
            None => parsed.path().to_string(),
        };
        Ok(Self::new(&host, &normalize_path(&path_and_query, keep)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fingerprint(&self, variant: &Variant) -> Fingerprint {
        build_key(&self.host, &self.path, variant)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_key_is_deterministic_and_host_case_insensitive() {
        let a = build_key("Example.com", "/blog/hello-world", &Variant::default());
        let b = build_key("example.com", "/blog/hello-world", &Variant::default());
        assert_eq!(a, b);
        assert_eq!(a.hash().len(), 32);
        assert!(is_valid_hash(a.hash()));
        assert_eq!(a.bucket(), &a.hash()[..2]);
    }

    #[test]
    fn different_paths_produce_different_hashes() {
        let a = build_key("example.com", "/a", &Variant::default());
        let b = build_key("example.com", "/b", &Variant::default());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn variants_share_hash_but_not_file_name() {
        let desktop = build_key("example.com", "/", &Variant::default());
        let mobile = build_key("example.com", "/", &Variant::mobile());
        let editor = build_key(
            "example.com",
            "/",
            &Variant::new(DeviceClass::Desktop, Some("Shop Manager".to_string())),
        );
        assert_eq!(desktop.hash(), mobile.hash());
        assert_eq!(mobile.suffix(), "-mobile");
        assert_eq!(editor.suffix(), "-role-shop_manager");
        assert_eq!(desktop.file_name(), format!("{}.html", desktop.hash()));
        assert_eq!(
            mobile.clone().with_format(OutputFormat::Xml).file_name(),
            format!("{}-mobile.xml", mobile.hash())
        );
    }

    #[test]
    fn normalize_keeps_sorted_key_params_and_drops_fragment() {
        let keep = |name: &str| name == "page" || name == "lang";
        assert_eq!(
            normalize_path("/list?utm_source=x&page=2&lang=en#top", keep),
            "/list?lang=en&page=2"
        );
        assert_eq!(normalize_path("/list?utm_source=x", keep), "/list");
        assert_eq!(normalize_path("", keep), "/");
    }

    #[test]
    fn page_key_from_url_ignores_tracking_params() {
        let keep = |name: &str| name == "page";
        let a = PageKey::from_url("https://Example.com/blog/?utm_medium=mail", keep).unwrap();
        let b = PageKey::from_url("https://example.com/blog/", keep).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.host(), "example.com");

        let ported = PageKey::from_url("http://localhost:8080/x?page=3", keep).unwrap();
        assert_eq!(ported.host(), "localhost:8080");
        assert_eq!(ported.path(), "/x?page=3");

        assert!(matches!(
            PageKey::from_url("/relative", keep),
            Err(KeyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn from_hash_rejects_traversal_and_bad_hex() {
        assert!(Fingerprint::from_hash("../../etc/passwd").is_err());
        assert!(Fingerprint::from_hash("ABCDEF0123456789ABCDEF0123456789").is_err());
        assert!(Fingerprint::from_hash("abc").is_err());
        let ok = Fingerprint::from_hash("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(ok.bucket(), "01");
    }

    #[test]
    fn format_detection() {
        assert_eq!(OutputFormat::detect("/blog/hello", None), OutputFormat::Html);
        assert_eq!(OutputFormat::detect("/feed/", None), OutputFormat::Xml);
        assert_eq!(OutputFormat::detect("/sitemap.xml", None), OutputFormat::Xml);
        assert_eq!(
            OutputFormat::detect("/api/posts", Some("application/json")),
            OutputFormat::Json
        );
    }

    #[test]
    fn entity_key_display() {
        assert_eq!(EntityKey::Content(42).to_string(), "content:42");
        assert_eq!(EntityKey::Term(7).to_string(), "term:7");
    }
}
