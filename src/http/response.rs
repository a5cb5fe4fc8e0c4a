//! Rendering decisions into HTTP headers and rejection responses.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch milliseconds
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: String,
    pub retry_after: u64,
}

impl RejectionBody {
    fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            error: "too_many_requests",
            message: format!(
                "Too many requests. Try again in {} seconds.",
                decision.retry_after_seconds
            ),
            retry_after: decision.retry_after_seconds,
        }
    }
}

/// The `X-RateLimit-*` headers for a decision.
pub fn headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    apply_headers(decision, &mut headers);
    headers
}

/// Insert the `X-RateLimit-*` headers into an existing map.
pub fn apply_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

/// 429 with the limit headers, `Retry-After` and a JSON body.
///
/// The header and the body's `retryAfter` are both the decision's single
/// `retry_after_seconds`.
pub fn build_429(decision: &RateLimitDecision) -> Response {
    let mut headers = headers(decision);
    headers.insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from(decision.retry_after_seconds),
    );

    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(RejectionBody::from_decision(decision)),
    )
        .into_response()
}
