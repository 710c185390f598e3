//! JSON admission API.
//!
//! `POST /v1/admit` lets out-of-process callers (proxies, sidecars) ask a
//! named limiter for a decision. `GET /health` is a liveness probe.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::middleware::{add_rate_limit_headers, add_retry_after};
use crate::ratelimit::LimiterRegistry;

/// Body of an admission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitRequest {
    /// Name of a configured limiter
    pub limiter: String,
    /// Caller identity, e.g. `ip:1.2.3.4` or `user:42`
    pub identifier: String,
    /// Endpoint key, e.g. `GET /api/items/:id`
    pub endpoint: String,
}

/// Build the admission API router.
pub fn router(registry: Arc<LimiterRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/admit", post(admit))
        .with_state(registry)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[instrument(
    skip_all,
    fields(limiter = %request.limiter, identifier = %request.identifier)
)]
async fn admit(
    State(registry): State<Arc<LimiterRegistry>>,
    Json(request): Json<AdmitRequest>,
) -> Response {
    if request.identifier.is_empty() {
        warn!("Received admission request with empty identifier");
        return error_response(StatusCode::BAD_REQUEST, "identifier is required");
    }
    if request.endpoint.is_empty() {
        warn!("Received admission request with empty endpoint");
        return error_response(StatusCode::BAD_REQUEST, "endpoint is required");
    }

    let Some(limiter) = registry.get(&request.limiter) else {
        warn!("Received admission request for unknown limiter");
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("unknown limiter '{}'", request.limiter),
        );
    };

    let decision = limiter.check(&request.identifier, &request.endpoint).await;
    debug!(
        allowed = decision.allowed,
        remaining = decision.remaining_requests,
        "Admission decided"
    );

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(&decision)).into_response();
    add_rate_limit_headers(response.headers_mut(), &decision);
    if !decision.allowed {
        add_retry_after(response.headers_mut(), &decision, limiter.now_ms());
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });
    (status, Json(body)).into_response()
}
