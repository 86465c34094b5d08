use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AdmissionError, Result};
use crate::identifier::resolve_identifier;
use crate::policy::{Policy, DEFAULT_POLICY};
use crate::rate_limiter::{LimiterStats, RateLimiter};
use crate::response::RateLimitResponse;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>) -> SharedState {
        Arc::new(Self { limiter })
    }
}

/// Caller signals for one admission check. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct AdmitRequest {
    pub policy: Option<String>,
    pub user_id: Option<String>,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PoliciesResponse {
    pub default_policy: &'static str,
    pub policies: Vec<Policy>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub policy: String,
    pub identifier: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub stats: LimiterStats,
}

/// Admit one request, answering 200 or 429 with rate limit headers
pub async fn admit(
    State(state): State<SharedState>,
    Json(payload): Json<AdmitRequest>,
) -> Result<impl IntoResponse> {
    let identifier = resolve_identifier(
        payload.user_id.as_deref(),
        payload.forwarded_for.as_deref(),
        payload.real_ip.as_deref(),
    );
    let policy = payload.policy.as_deref().unwrap_or(DEFAULT_POLICY);

    let now_ms = state.limiter.now_ms();
    let decision = state.limiter.try_admit_at(policy, &identifier, now_ms)?;

    Ok(RateLimitResponse::new(policy, &identifier, decision, now_ms))
}

/// List all configured policies
pub async fn list_policies(State(state): State<SharedState>) -> Json<PoliciesResponse> {
    Json(PoliciesResponse {
        default_policy: DEFAULT_POLICY,
        policies: state.limiter.policies().iter().cloned().collect(),
    })
}

/// Get a single policy by name
pub async fn get_policy(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<Policy>> {
    state
        .limiter
        .policy(&name)
        .cloned()
        .map(Json)
        .ok_or(AdmissionError::UnknownPolicy(name))
}

/// Drop the bucket for an identifier under a policy
pub async fn reset_bucket(
    State(state): State<SharedState>,
    Path((policy, identifier)): Path<(String, String)>,
) -> Result<Json<ResetResponse>> {
    let removed = state.limiter.reset(&policy, &identifier)?;
    Ok(Json(ResetResponse {
        policy,
        identifier,
        removed,
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stats: state.limiter.stats(),
    })
}
