//! Page cache middleware.
//!
//! Serves stored pages for cacheable requests and captures the final body of
//! misses. Store I/O runs on the blocking pool. Bodies are buffered only up to
//! `max_payload_bytes`; anything longer streams through uncached.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};
use url::form_urlencoded;

use crate::admission::{RequestContext, parse_cookie_header};

use super::deps;
use super::engine::{PageCacheEngine, RequestState, StoreOutcome};
use super::keys::OutputFormat;
use super::store::StoredPage;

/// Response header telling clients whether the page came from the cache.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-sitecache");

#[derive(Clone)]
pub struct CacheState {
    pub engine: Arc<PageCacheEngine>,
}

impl CacheState {
    pub fn new(engine: Arc<PageCacheEngine>) -> Self {
        Self { engine }
    }
}

/// Role of the signed-in user, inserted as a request extension by the
/// authentication layer that runs before this middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedRole(pub String);

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let context = request_context(&request);
    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    let format = OutputFormat::detect(request.uri().path(), accept);

    let (key, fingerprint) = match cache.engine.begin(&context, format) {
        RequestState::Cacheable { key, fingerprint } => (key, fingerprint),
        RequestState::NotCacheable(reason) => {
            debug!(cache = "page", outcome = "bypass", reason = %reason, "request not cacheable");
            return next.run(request).await;
        }
    };

    let engine = Arc::clone(&cache.engine);
    let lookup_fingerprint = fingerprint.clone();
    match tokio::task::spawn_blocking(move || engine.lookup(&lookup_fingerprint)).await {
        Ok(Some(page)) => {
            debug!(cache = "page", outcome = "hit", "serving cached page");
            return hit_response(page);
        }
        Ok(None) => debug!(cache = "page", outcome = "miss", "cache miss, executing handler"),
        Err(err) => warn!(
            target = "cache::middleware",
            op = "lookup",
            result = "join_error",
            error = %err,
            "Page cache lookup task failed; treating as miss"
        ),
    }

    let (mut response, deps) = deps::with_collector(next.run(request)).await;
    let max_payload_bytes = cache.engine.config().max_payload_bytes;
    if !should_capture(&response, max_payload_bytes) {
        mark_miss(response.headers_mut());
        return response;
    }

    let (mut parts, body) = response.into_parts();
    mark_miss(&mut parts.headers);
    let bytes = match buffer_body(body, max_payload_bytes).await {
        Ok(Captured::Complete(bytes)) => bytes,
        Ok(Captured::TooLarge(body)) => {
            debug!(
                cache = "page",
                outcome = "skip",
                reason = "too_large",
                limit = max_payload_bytes,
                "response body exceeds payload limit; streaming uncached"
            );
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            warn!(
                target = "cache::middleware",
                op = "buffer_response",
                result = "error",
                error = %err,
                "Failed to buffer response body"
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let engine = Arc::clone(&cache.engine);
    let status = parts.status;
    let headers = parts.headers.clone();
    let rendered = bytes.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        engine.finish(&key, &fingerprint, status, &headers, rendered, deps)
    })
    .await;

    match outcome {
        Ok(StoreOutcome::Stored(stored)) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(stored))
        }
        Ok(StoreOutcome::Skipped(_, body)) => Response::from_parts(parts, Body::from(body)),
        Err(err) => {
            warn!(
                target = "cache::middleware",
                op = "store",
                result = "join_error",
                error = %err,
                "Page cache store task failed; serving rendered response"
            );
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}

enum Captured {
    Complete(Bytes),
    /// The buffered prefix followed by the unread remainder.
    TooLarge(Body),
}

/// Read data frames until the body ends or grows past `limit`.
///
/// Trailers are not cached and are dropped from complete bodies.
async fn buffer_body(mut body: Body, limit: usize) -> Result<Captured, axum::Error> {
    let mut buffered = BytesMut::new();
    loop {
        let Some(frame) = body.frame().await else {
            break;
        };
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);
        if buffered.len() > limit {
            let prefix = stream::once(future::ready(Ok::<_, axum::Error>(buffered.freeze())));
            let rest = body.into_data_stream();
            return Ok(Captured::TooLarge(Body::from_stream(prefix.chain(rest))));
        }
    }
    Ok(Captured::Complete(buffered.freeze()))
}

fn mark_miss(headers: &mut HeaderMap) {
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
}

/// Only plain successful responses are worth buffering.
fn should_capture(response: &Response, max_payload_bytes: usize) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }
    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }
    let headers = response.headers();
    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    !declared_len.is_some_and(|len| len > max_payload_bytes)
}

fn hit_response(page: StoredPage) -> Response {
    let mut response = Response::new(Body::from(page.payload));
    let headers = response.headers_mut();
    if let Ok(content_type) = HeaderValue::from_str(&page.content_type) {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
    response
}

/// Collect the facts admission needs from an inbound request.
pub fn request_context(request: &Request<Body>) -> RequestContext {
    let headers = request.headers();
    let header_str = |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());

    let host = header_str(header::HOST)
        .map(str::to_string)
        .or_else(|| {
            request.uri().authority().map(|authority| authority.as_str().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string());

    let mut context = RequestContext::get(host, request.uri().path())
        .with_method(request.method().clone())
        .with_ajax(
            header_str(HeaderName::from_static("x-requested-with"))
                .is_some_and(|value| value.eq_ignore_ascii_case("XMLHttpRequest")),
        );

    if let Some(query) = request.uri().query() {
        context.query = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
    }
    for cookie_header in headers.get_all(header::COOKIE) {
        if let Ok(value) = cookie_header.to_str() {
            context.cookies.extend(parse_cookie_header(value));
        }
    }
    if let Some(user_agent) = header_str(header::USER_AGENT) {
        context = context.with_user_agent(user_agent);
    }
    if let Some(referrer) = header_str(header::REFERER) {
        context = context.with_referrer(referrer);
    }
    if let Some(ip) = client_ip(request) {
        context = context.with_client_ip(ip);
    }
    if let Some(AuthenticatedRole(role)) = request.extensions().get::<AuthenticatedRole>() {
        context = context.with_role(role.clone());
    }
    context
}

fn client_ip(request: &Request<Body>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}
