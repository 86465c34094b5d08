use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::decision::Decision;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Write the rate limit headers for `decision` into `headers`.
///
/// `Retry-After` is only set on denial.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision, now_ms: i64) {
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(decision.limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(decision.remaining),
    );
    if let Ok(reset) = HeaderValue::from_str(&decision.reset_at_rfc3339()) {
        headers.insert(HeaderName::from_static(RESET_HEADER), reset);
    }
    if decision.allowed {
        headers.remove(RETRY_AFTER_HEADER);
    } else {
        headers.insert(
            HeaderName::from_static(RETRY_AFTER_HEADER),
            HeaderValue::from(decision.retry_after_secs(now_ms)),
        );
    }
}

/// JSON body returned by the decision endpoint.
#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub policy: String,
    pub identifier: String,
    #[serde(flatten)]
    pub decision: Decision,
    pub reset_at: String,
    pub retry_after: Option<u64>,
    #[serde(skip)]
    now_ms: i64,
}

impl RateLimitResponse {
    pub fn new(policy: &str, identifier: &str, decision: Decision, now_ms: i64) -> Self {
        Self {
            policy: policy.to_string(),
            identifier: identifier.to_string(),
            reset_at: decision.reset_at_rfc3339(),
            retry_after: (!decision.allowed).then(|| decision.retry_after_secs(now_ms)),
            decision,
            now_ms,
        }
    }

    pub fn status(&self) -> StatusCode {
        if self.decision.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }
}

impl IntoResponse for RateLimitResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &self.decision, self.now_ms);
        (self.status(), headers, Json(self)).into_response()
    }
}
