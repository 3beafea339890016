use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::core::fallback::FallbackError;

/// Error returned by REST handlers, rendered as `{"error": ..., "code": ...}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fallback(FallbackError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Fallback(FallbackError::Configuration(_)) => StatusCode::BAD_REQUEST,
            Self::Fallback(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Fallback(FallbackError::RunTerminal { .. }) => "run_terminal",
            Self::Fallback(FallbackError::Timeout(_)) => "upstream_timeout",
            Self::Fallback(FallbackError::AuthenticationFailed(_)) => "upstream_auth_failed",
            Self::Fallback(FallbackError::Configuration(_)) => "invalid_request",
            Self::Fallback(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}
