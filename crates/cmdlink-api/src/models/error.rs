//! Unified error handling for the API.

use std::fmt;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use cmdlink_commands::DispatchError;

/// API error response with its HTTP status code.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// Bad request (400).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message, StatusCode::BAD_REQUEST)
    }

    /// Unauthorized (401).
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message, StatusCode::UNAUTHORIZED)
    }

    /// Broker disconnected (503).
    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            "TRANSPORT_UNAVAILABLE",
            message,
            StatusCode::SERVICE_UNAVAILABLE,
        )
    }

    /// Publish rejected or timed out (500).
    pub fn publish_failure(message: impl Into<String>) -> Self {
        Self::new(
            "PUBLISH_FAILURE",
            message,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, axum::Json(body)).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}

impl From<DispatchError> for ErrorResponse {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Validation(msg) => Self::validation(msg),
            DispatchError::TransportUnavailable => Self::transport_unavailable(e.to_string()),
            DispatchError::PublishFailure(_) => Self::publish_failure(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ErrorResponse {
    fn from(e: JsonRejection) -> Self {
        Self::validation(e.body_text())
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ErrorResponse>;
