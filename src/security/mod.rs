// src/security/mod.rs
//! Admission gateway: every inbound request passes through these layers before a
//! handler runs. Order, outermost first:
//! CORS → request id → trace → rate admission → CSRF → body sanitization.

pub mod cors;
pub mod crypto;
pub mod csrf;
pub mod rate_limit;
pub mod sanitize;

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header::CONTENT_LENGTH, header::CONTENT_TYPE, request::Parts, Extensions, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{ApiError, ApiFailure, ExposeDetail};

pub use cors::OriginPolicy;
pub use crypto::{Cipher, CipherConfig};
pub use csrf::CsrfStore;
pub use rate_limit::{Admission, RateLimiter};
pub use sanitize::{sanitize, sanitize_json, validate_input, CleanQuery};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const SESSION_HEADER: &str = "x-session-id";

/// Bodies above this size are rejected before parsing.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const CSRF_SESSIONS: usize = 10_000;

/// Machine-to-machine endpoints that never carry a browser session.
const CSRF_EXEMPT: &[&str] = &["/interventions", "/webhook"];

/// Correlation id attached to every request and echoed on every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    /// The id assigned by [`assign_request_id`], or a fresh one outside the middleware.
    pub fn from_extensions(ext: &Extensions) -> Self {
        ext.get::<RequestId>().cloned().unwrap_or_else(RequestId::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestId::from_extensions(&parts.extensions))
    }
}

/// Shared admission state.
pub struct Gateway {
    pub limiter: RateLimiter,
    pub csrf: CsrfStore,
    pub origins: Arc<OriginPolicy>,
    pub csrf_enforce: bool,
    /// Proxies whose `X-Forwarded-For` entries are trusted; see [`client_identity`].
    pub trusted_proxy_hops: usize,
    pub expose_detail: bool,
}

impl Gateway {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            limiter: RateLimiter::from_settings(&cfg.rate_limit),
            csrf: CsrfStore::new(CSRF_SESSIONS),
            origins: Arc::new(OriginPolicy::from_list(&cfg.cors_origins)),
            csrf_enforce: cfg.csrf_enforce,
            trusted_proxy_hops: cfg.trusted_proxy_hops,
            expose_detail: !cfg.is_production(),
        }
    }

    /// Periodically drop idle client windows so memory tracks active clients only.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.limiter.window().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gw) = weak.upgrade() else { break };
                let removed = gw.limiter.sweep(Instant::now());
                debug!(target: "gateway", removed, "rate-limit sweep");
            }
        })
    }
}

fn valid_incoming_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| valid_incoming_id(s))
        .map(|s| RequestId(s.to_string()))
        .unwrap_or_else(RequestId::generate);
    req.extensions_mut().insert(id.clone());

    let mut resp = next.run(req).await;
    if !resp.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(v) = HeaderValue::from_str(id.as_str()) {
            resp.headers_mut().insert(REQUEST_ID_HEADER, v);
        }
    }
    resp
}

/// Rate-limit key for a request.
///
/// With `trusted_hops == 0` only the socket peer counts; forwarding headers are
/// client-controlled and ignored. Otherwise each trusted proxy appended one entry to
/// `X-Forwarded-For`, so the entry `trusted_hops` from the right is the first one no
/// trusted proxy vouched for. `X-Real-IP` is consulted only when that header is absent.
pub fn client_identity(req: &Request, trusted_hops: usize) -> String {
    let peer = || {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
    };
    if trusted_hops == 0 {
        return peer().unwrap_or_else(|| "unknown".to_string());
    }

    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
    let forwarded = header("x-forwarded-for").and_then(|raw| {
        let hops: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let idx = hops.len().saturating_sub(trusted_hops);
        hops.get(idx).map(|s| s.to_string())
    });
    forwarded
        .or_else(|| {
            header("x-real-ip")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .or_else(peer)
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_admission(
    State(gw): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiFailure> {
    let client = client_identity(&req, gw.trusted_proxy_hops);
    match gw.limiter.admit(&client, Instant::now()) {
        Admission::Allow { remaining } => {
            let mut resp = next.run(req).await;
            let headers = resp.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(gw.limiter.max_requests()));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            Ok(resp)
        }
        Admission::Deny { retry_after } => {
            counter!("gateway_rate_limited_total").increment(1);
            warn!(target: "gateway", client = %client, path = %req.uri().path(), "rate limit exceeded");
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            Err(ApiFailure::new(
                RequestId::from_extensions(req.extensions()),
                ApiError::RateLimited {
                    retry_after_secs: secs.max(1),
                },
            ))
        }
    }
}

pub async fn csrf_guard(
    State(gw): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiFailure> {
    let exempt = req.method() != Method::POST || CSRF_EXEMPT.contains(&req.uri().path());
    if !gw.csrf_enforce || exempt {
        return Ok(next.run(req).await);
    }

    let verified = {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
        gw.csrf.verify(header(SESSION_HEADER), header(CSRF_HEADER))
    };
    if verified {
        return Ok(next.run(req).await);
    }

    counter!("gateway_csrf_rejected_total").increment(1);
    warn!(target: "gateway", path = %req.uri().path(), "csrf verification failed");
    Err(ApiFailure::new(
        RequestId::from_extensions(req.extensions()),
        ApiError::CsrfRejected,
    ))
}

/// Re-serialize JSON bodies with every string value sanitized.
pub async fn sanitize_body(
    State(gw): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiFailure> {
    req.extensions_mut().insert(ExposeDetail(gw.expose_detail));
    let is_json = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.contains("+json")
        })
        .unwrap_or(false);
    if !is_json {
        return Ok(next.run(req).await);
    }

    let request_id = RequestId::from_extensions(req.extensions());
    let (mut parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| {
        ApiFailure::new(
            request_id.clone(),
            ApiError::invalid("body", "request body unreadable or too large"),
        )
    })?;
    if bytes.is_empty() {
        return Ok(next.run(Request::from_parts(parts, Body::empty())).await);
    }

    let mut value: Value = serde_json::from_slice(&bytes).map_err(|e| {
        let message = if gw.expose_detail {
            format!("malformed JSON: {e}")
        } else {
            "malformed JSON".to_string()
        };
        ApiFailure::new(request_id.clone(), ApiError::invalid("body", message))
            .exposing_detail(gw.expose_detail)
    })?;
    sanitize::sanitize_json(&mut value);
    let cleaned = serde_json::to_vec(&value).map_err(|e| {
        ApiFailure::new(request_id, ApiError::invalid("body", e.to_string()))
    })?;

    parts.headers.remove(CONTENT_LENGTH);
    Ok(next.run(Request::from_parts(parts, Body::from(cleaned))).await)
}
