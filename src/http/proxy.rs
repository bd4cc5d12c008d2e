//! The proxied-request pipeline.
//!
//! Stage order: payload cap, homepage redirect, target extraction, caller
//! identity, preflight short-circuit, authorization (local origin or
//! tenant + subscription), rate limit, free-tier quota, secret
//! substitution, header filtering, upstream dispatch, response rewrite.
//! Every stage short-circuits with a `ProxyError`; rate-limit headers ride
//! on everything produced after the limiter ran.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, EXPIRES, LOCATION, SET_COOKIE,
    TRANSFER_ENCODING,
};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use tracing::Instrument;

use crate::error::ProxyError;
use crate::http::jsonp;
use crate::http::request::{
    caller_identity, extract_target, is_local_origin, CallerIdentity, ProxyTarget,
};
use crate::lifecycle::AppContext;
use crate::security::LimitScope;
use crate::upstream::MeteredStream;

/// Presence opts the response into edge-cache-friendly headers.
const CACHE_HEADER: &str = "x-corsfix-cache";
/// JSON object of header overrides applied after filtering.
const OVERRIDE_HEADER: &str = "x-corsfix-headers";

/// What the authorization stage decided about this caller.
struct Lease {
    user_id: Option<String>,
    application_id: Option<String>,
    free: bool,
    local: bool,
    key: String,
    rpm: u32,
    scope: LimitScope,
}

pub async fn handle(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::debug_span!("request", %request_id);
    match pipeline(ctx, peer, request).instrument(span).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn pipeline(
    ctx: Arc<AppContext>,
    peer: SocketAddr,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let declared_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_length.is_some_and(|len| len > ctx.config.security.max_payload_bytes) {
        return Err(ProxyError::PayloadTooLarge);
    }

    if parts.uri.path() == "/" && parts.uri.query().is_none() {
        return Ok(homepage_redirect(&ctx.config.homepage_url));
    }

    let target = extract_target(&parts.uri)?;
    let identity = caller_identity(&parts.headers, &target)?;

    tracing::debug!(
        origin = %identity.origin(),
        target = %target.url,
        method = %parts.method,
        "proxying request"
    );

    if parts.method == Method::OPTIONS {
        return Ok(preflight(&ctx, &parts.headers, &target, &identity));
    }

    let lease = authorize(&ctx, &identity, &target, &parts.headers, peer).await?;

    let decision = ctx.limiter.consume(&lease.key, lease.rpm, lease.scope).await;
    if !decision.allowed {
        return Err(ProxyError::RateLimited(decision));
    }

    let mut response = match forward(&ctx, parts, body, target, &identity, &lease).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(&value))
        {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

/// Map the caller to a rate-limit key and tier, rejecting unregistered
/// origins and disallowed targets.
async fn authorize(
    ctx: &Arc<AppContext>,
    identity: &CallerIdentity,
    target: &ProxyTarget,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<Lease, ProxyError> {
    let origin = identity.origin();

    if is_local_origin(origin, &ctx.config.local_origins.first_party) {
        let key = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| peer.ip().to_string());
        return Ok(Lease {
            user_id: None,
            application_id: None,
            free: false,
            local: true,
            key,
            rpm: ctx.config.local_origins.rpm,
            scope: LimitScope::Local,
        });
    }

    let tenant = ctx
        .resolver
        .resolve(origin)
        .await?
        .ok_or(ProxyError::NoTenant)?;
    if !tenant.allows_target(target.url.as_str()) {
        return Err(ProxyError::TargetNotAllowed);
    }

    match ctx.subscriptions.active_for(&tenant.user_id).await? {
        Some(subscription) => Ok(Lease {
            user_id: Some(tenant.user_id.clone()),
            application_id: Some(tenant.id.clone()),
            free: false,
            local: false,
            key: tenant.user_id.clone(),
            rpm: ctx.config.rpm_for_product(&subscription.product_id),
            scope: LimitScope::Shared,
        }),
        None => Ok(Lease {
            user_id: Some(tenant.user_id.clone()),
            application_id: Some(tenant.id.clone()),
            free: true,
            local: false,
            key: tenant.user_id.clone(),
            rpm: ctx.config.free_tier.rpm,
            scope: LimitScope::Local,
        }),
    }
}

/// Everything past the rate limiter: quota, substitution, dispatch, and
/// response rewriting.
async fn forward(
    ctx: &Arc<AppContext>,
    parts: Parts,
    body: Body,
    target: ProxyTarget,
    identity: &CallerIdentity,
    lease: &Lease,
) -> Result<Response, ProxyError> {
    if lease.free {
        if let Some(user_id) = &lease.user_id {
            ctx.quota.check(user_id).await?;
        }
    }

    let origin = identity.origin();
    let cache_requested = parts.headers.contains_key(CACHE_HEADER);

    let mut upstream_headers = filter_request_headers(&parts.headers);
    apply_overrides(&mut upstream_headers, parts.headers.get(OVERRIDE_HEADER));

    // Usage records and dedup markers key on the URL as the caller sent
    // it; substituted secrets stay out of shared state.
    let metrics_url = target.url.to_string();

    let (url, upstream_headers) = ctx
        .vault
        .substitute(target.url, upstream_headers, lease.application_id.as_deref())
        .await?;

    let request_body = if parts.method == Method::GET || parts.method == Method::HEAD {
        None
    } else {
        let bytes = axum::body::to_bytes(body, ctx.config.security.max_body_bytes)
            .await
            .map_err(|_| ProxyError::PayloadTooLarge)?;
        Some(bytes)
    };

    let upstream = ctx
        .dispatcher
        .dispatch(parts.method.clone(), url, upstream_headers, request_body)
        .await?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    headers.remove(CONTENT_ENCODING);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(SET_COOKIE);
    headers.remove("set-cookie2");

    let mut cache_enabled = cache_requested;
    if target.callback.is_none() {
        let origin_value = HeaderValue::from_str(origin)
            .map_err(|_| ProxyError::Unknown("origin is not a valid header value".into()))?;
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("*"));
        if cache_enabled {
            headers.remove(EXPIRES);
            headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=3600"),
            );
        }
    }
    if lease.free {
        // Free-tier responses are never edge-cached and never deduped.
        cache_enabled = false;
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    if lease.local {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }

    if let Some(callback) = target.callback {
        let body = buffer_jsonp(upstream, ctx.config.security.max_jsonp_bytes).await?;
        return Ok(jsonp::render(&callback, status, &headers, body));
    }

    // What the server will write before it stops polling the body.
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let stream = upstream.bytes_stream();
    let body = match lease.user_id.clone() {
        Some(user_id) => {
            let ctx = ctx.clone();
            let origin = origin.to_string();
            let target_url = metrics_url;
            Body::from_stream(MeteredStream::new(stream, declared, move |bytes| {
                tokio::spawn(async move {
                    ctx.usage
                        .record_response(&user_id, &origin, &target_url, bytes, cache_enabled)
                        .await;
                });
            }))
        }
        None => Body::from_stream(stream),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Short-circuit CORS preflights, echoing the requested method and
/// headers. A preflight that asks for the cache opt-in header may be the
/// only trace of an edge-cache hit, so its usage is attributed here.
fn preflight(
    ctx: &Arc<AppContext>,
    headers: &HeaderMap,
    target: &ProxyTarget,
    identity: &CallerIdentity,
) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;

    if let Ok(value) = HeaderValue::from_str(identity.origin()) {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    if let Some(method) = headers.get(ACCESS_CONTROL_REQUEST_METHOD) {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }
    if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());

        let asks_for_cache = requested
            .to_str()
            .is_ok_and(|v| v.split(',').any(|h| h.trim().eq_ignore_ascii_case(CACHE_HEADER)));
        if asks_for_cache {
            let ctx = ctx.clone();
            let url = target.url.to_string();
            let origin = identity.origin().to_string();
            tokio::spawn(async move {
                ctx.usage.attribute_preflight(&url, &origin).await;
            });
        }
    }

    response
}

fn homepage_redirect(homepage: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(homepage) {
        response.headers_mut().insert(LOCATION, value);
    }
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    response
}

/// Drop identity, fingerprinting, proxy-control, and connection-managed
/// headers before forwarding. `accept-encoding` is dropped for everyone:
/// the outbound client negotiates its own encoding and transparently
/// decompresses, and the rewritten response carries no `content-encoding`.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let key = name.as_str();
        let drop = key == "referer"
            || key == "origin"
            || key == "host"
            || key == "content-length"
            || key == "accept-encoding"
            || key.starts_with("sec-")
            || key.starts_with("x-corsfix-")
            || key.starts_with("x-forwarded-");
        if !drop {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Apply caller-supplied overrides from the JSON override header. Keys are
/// lowercased; malformed JSON and non-string values are ignored.
fn apply_overrides(headers: &mut HeaderMap, raw: Option<&HeaderValue>) {
    let Some(raw) = raw.and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) else {
        return;
    };
    for (key, value) in map {
        let Some(value) = value.as_str() else { continue };
        if let (Ok(name), Ok(value)) = (
            key.to_lowercase().parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Buffer an upstream body for JSONP, enforcing the cap against the
/// declared length first and the actual bytes second.
async fn buffer_jsonp(
    mut upstream: reqwest::Response,
    max_bytes: usize,
) -> Result<Bytes, ProxyError> {
    let declared = upstream
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_bytes) {
        return Err(ProxyError::JsonpTooLarge);
    }

    let mut buffer = BytesMut::new();
    while let Some(chunk) = upstream
        .chunk()
        .await
        .map_err(crate::upstream::dispatch::classify)?
    {
        if buffer.len() + chunk.len() > max_bytes {
            return Err(ProxyError::JsonpTooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}
