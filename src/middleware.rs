use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::error::{ErrorResponse, Result};
use crate::identifier::identifier_from_headers;
use crate::rate_limiter::RateLimiter;
use crate::response::apply_rate_limit_headers;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity of the caller, inserted into request extensions by an upstream
/// authentication layer. Takes precedence over forwarding headers.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// A policy bound to a limiter, checked when the router is assembled.
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    limiter: Arc<RateLimiter>,
    policy: Arc<str>,
}

impl PolicyGuard {
    /// Fails if `policy` is not registered with `limiter`.
    pub fn new(limiter: Arc<RateLimiter>, policy: &str) -> Result<Self> {
        limiter.policies().lookup(policy)?;
        Ok(Self {
            limiter,
            policy: Arc::from(policy),
        })
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }
}

/// Admit the request under the guard's policy or answer 429.
///
/// ```ignore
/// let guard = PolicyGuard::new(limiter, "search")?;
/// let router = Router::new()
///     .route("/search", get(search))
///     .layer(axum::middleware::from_fn_with_state(guard, enforce_policy));
/// ```
pub async fn enforce_policy(
    State(guard): State<PolicyGuard>,
    request: Request,
    next: Next,
) -> Response {
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());
    let identifier = identifier_from_headers(user_id.as_deref(), request.headers());

    let now_ms = guard.limiter.now_ms();
    let decision = match guard.limiter.try_admit_at(guard.policy(), &identifier, now_ms) {
        Ok(decision) => decision,
        Err(err) => return err.into_response(),
    };

    if !decision.allowed {
        let mut response = ErrorResponse::rate_limited(guard.policy()).into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision, now_ms);
        return response;
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision, now_ms);
    response
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    let client = identifier_from_headers(None, request.headers());
    let span = tracing::info_span!("request", request_id = %request_id);

    async move {
        let started = Instant::now();
        info!(
            target: "admission::middleware",
            method = %method,
            uri = %uri,
            client = %client,
            "Incoming request"
        );

        let mut response = next.run(request).await;

        info!(
            target: "admission::middleware",
            method = %method,
            uri = %uri,
            status = %response.status(),
            latency_ms = elapsed_ms(started),
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        response
    }
    .instrument(span)
    .await
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
