use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// A caller named a policy that is not in the registry.
    #[error("Unknown rate limit policy '{0}'")]
    UnknownPolicy(String),
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

impl From<envconfig::Error> for AdmissionError {
    fn from(err: envconfig::Error) -> Self {
        AdmissionError::Configuration(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::Configuration(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        let message = err.to_string();
        match err {
            AdmissionError::UnknownPolicy(_) => Self::new("unknown_policy", &message, 404),
            AdmissionError::InvalidPolicy(_) => Self::new("invalid_policy", &message, 422),
            AdmissionError::Configuration(_) => Self::new("configuration_error", &message, 500),
            AdmissionError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }

    pub fn rate_limited(policy: &str) -> Self {
        Self::new(
            "rate_limit_exceeded",
            &format!("Too many requests for '{}', try again later", policy),
            429,
        )
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        ErrorResponse::from_admission_error(&self).into_response()
    }
}
