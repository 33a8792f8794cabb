//! Error types for forumchat
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for HTTP responses and renders
//! the same structured body used in WebSocket acknowledgments.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource missing or soft-deleted (404)
    #[error("Resource not found")]
    NotFound,

    /// Missing or invalid credential (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Valid user, not permitted for this resource (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed input (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the resource's current state (400)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invariant violation (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Real-time fan-out error (500)
    #[error("Pub/sub error: {0}")]
    PubSub(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::PubSub(err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

/// Client-visible error payload: kind + message, never internal detail.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Conflict(_) => "conflict",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::PubSub(_) => "pubsub",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::PubSub(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error for clients
    ///
    /// Server-side failures are logged with full detail and reported
    /// to the client with a generic message only.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            AppError::Validation(msg) | AppError::InvalidState(msg) | AppError::Conflict(msg) => {
                msg.clone()
            }
            AppError::NotFound | AppError::Unauthorized | AppError::Forbidden => self.to_string(),
            AppError::Database(_) => "Database error".to_string(),
            AppError::Config(_) | AppError::PubSub(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
        };

        if self.status_code().is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        ErrorBody {
            kind: self.kind(),
            message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_body(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
