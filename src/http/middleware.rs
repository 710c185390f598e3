//! axum middleware gating requests through a [`Limiter`].
//!
//! Allowed requests pass through untouched. Denied requests get a terminal
//! `429 Too Many Requests` with rate-limit headers.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::debug;

use super::identity::{endpoint_key, resolve_identifier, TrustedProxies};
use crate::ratelimit::{Decision, DenyReason, Limiter};

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Middleware state: the limiter to consult and the proxies whose
/// forwarding headers may name the client.
#[derive(Debug, Clone)]
pub struct Gate {
    limiter: Limiter,
    trusted_proxies: TrustedProxies,
}

impl Gate {
    /// Gate identifying clients by their connection peer only.
    pub fn new(limiter: Limiter) -> Self {
        Self {
            limiter,
            trusted_proxies: TrustedProxies::default(),
        }
    }

    /// Honour forwarding headers on connections from `proxies`.
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.trusted_proxies = proxies;
        self
    }
}

/// Rate limiting middleware.
///
/// Install with `axum::middleware::from_fn_with_state(Gate::new(limiter), enforce)`
/// on a server built with `into_make_service_with_connect_info`. The
/// identifier comes from a [`Principal`](super::Principal) extension or the
/// client address; the endpoint key from the method and normalized path.
pub async fn enforce(State(gate): State<Gate>, request: Request, next: Next) -> Response {
    let limiter = &gate.limiter;
    let identifier = resolve_identifier(&request, &gate.trusted_proxies);
    let endpoint = endpoint_key(request.method(), request.uri().path());

    let decision = limiter.check(&identifier, &endpoint).await;
    if decision.allowed {
        return next.run(request).await;
    }

    debug!(
        limiter = %limiter.name(),
        identifier = %identifier,
        endpoint = %endpoint,
        reason = ?decision.reason,
        "Request rejected"
    );
    rate_limited_response(&decision, limiter.now_ms())
}

/// Terminal 429 response for a denied decision.
pub fn rate_limited_response(decision: &Decision, now_ms: u64) -> Response {
    let message = match decision.reason {
        Some(DenyReason::BurstExceeded) => "Too many requests in a short period. Please slow down.",
        Some(DenyReason::Blacklisted) => {
            "Access temporarily blocked due to repeated rate limit violations."
        }
        _ => "Rate limit exceeded. Please try again later.",
    };

    let reset_time = i64::try_from(decision.reset_time)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.to_rfc3339());

    let body = json!({
        "error": "Too Many Requests",
        "message": message,
        "resetTime": reset_time,
        "remainingRequests": decision.remaining_requests,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    add_rate_limit_headers(response.headers_mut(), decision);
    add_retry_after(response.headers_mut(), decision, now_ms);
    response
}

/// Insert `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset` (unix seconds).
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining_requests),
    );
    headers.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_time.div_ceil(1000)),
    );
}

/// Insert `Retry-After` as whole seconds until the reset.
pub fn add_retry_after(headers: &mut HeaderMap, decision: &Decision, now_ms: u64) {
    let seconds = decision.retry_after_ms(now_ms).div_ceil(1000);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
}
