//! Error handling module
//!
//! Gateway error taxonomy and its mapping onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed body, missing model, invalid alias
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No eligible credential, or every refresh attempt failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Model resolves to a provider with no configured connection
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Upstream said 429
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Upstream 5xx or malformed upstream answer
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Could not reach the upstream at all
    #[error("Upstream connection failed: {0}")]
    Network(String),

    /// Per-attempt wall clock exceeded
    #[error("Upstream timeout")]
    Timeout,

    /// Combo exhausted, all models failed
    #[error("All models failed: {0}")]
    Exhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::ProviderNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Network(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Config(_)
            | GatewayError::Serialization(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error type string used in response bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) | GatewayError::ProviderNotConfigured(_) => {
                "invalid_request_error"
            }
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::Timeout => "timeout_error",
            GatewayError::Exhausted(_) => "overloaded_error",
            GatewayError::NotFound(_) => "not_found_error",
            _ => "api_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {} ({})", self, status);
        } else {
            tracing::warn!("request rejected: {} ({})", self, status);
        }
        let body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error body with an explicit upstream status, for failures surfaced as-is
pub fn upstream_error_response(status: Option<u16>, message: &str) -> Response {
    let status = status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let error_type = match status.as_u16() {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    };
    let body = json!({"error": {"type": error_type, "message": message}});
    (status, Json(body)).into_response()
}
