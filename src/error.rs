//! Error types for int-activitypub
//!
//! All errors in the application are converted to `AppError`.
//! Components wrap lower-layer failures into one of the variants below so
//! callers can match on the kind of failure instead of its message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Caller input is malformed (400)
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Resource not found (404)
    #[error("not found")]
    NotFound,

    /// The caller does not own the resource (403)
    #[error("access denied")]
    Forbidden,

    /// Resource already exists (409)
    #[error("already exists")]
    Conflict,

    /// The remote actor or activity opted out of automated processing (422)
    #[error("actor or activity is tagged #nobot")]
    NoBot,

    /// The internal bus refused to accept an event (422)
    #[error("event was not accepted: {0}")]
    NoAccept(String),

    /// The remote actor is gone (410)
    #[error("actor is gone")]
    ActorGone,

    /// WebFinger resolution failed
    #[error("webfinger resolution failed: {0}")]
    WebFinger(String),

    /// Remote actor fetch failed
    #[error("failed to fetch actor: {0}")]
    ActorFetch(String),

    /// Remote inbox delivery failed
    #[error("failed to send activity: {0}")]
    ActivitySend(String),

    /// HTTP signature verification or creation failed (400)
    #[error("signature error: {0}")]
    Signature(String),

    /// Storage failure (500)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event bus write failed after retries
    #[error("failed to write event: {0}")]
    Writer(String),

    /// The configured queue does not exist on the bus
    #[error("queue is missing: {0}")]
    QueueMissing(String),

    /// The operation was cancelled by its caller
    #[error("operation cancelled")]
    Canceled,

    /// Configuration error (500)
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// gRPC-style status code name used by the internal API.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Invalid(_) => "INVALID_ARGUMENT",
            AppError::NotFound => "NOT_FOUND",
            AppError::Conflict => "ALREADY_EXISTS",
            AppError::Forbidden => "PERMISSION_DENIED",
            AppError::NoBot | AppError::NoAccept(_) => "FAILED_PRECONDITION",
            AppError::Canceled => "CANCELLED",
            _ => "INTERNAL",
        }
    }

    /// Short label used for the error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Invalid(_) => "invalid",
            AppError::NotFound => "not_found",
            AppError::Forbidden => "forbidden",
            AppError::Conflict => "conflict",
            AppError::NoBot => "nobot",
            AppError::NoAccept(_) => "no_accept",
            AppError::ActorGone => "actor_gone",
            AppError::WebFinger(_) => "webfinger",
            AppError::ActorFetch(_) => "actor_fetch",
            AppError::ActivitySend(_) => "activity_send",
            AppError::Signature(_) => "signature",
            AppError::Database(_) => "database",
            AppError::Writer(_) => "writer",
            AppError::QueueMissing(_) => "queue_missing",
            AppError::Canceled => "canceled",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Signature(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Conflict => (StatusCode::CONFLICT, self.to_string()),
            AppError::NoBot | AppError::NoAccept(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::ActorGone => (StatusCode::GONE, self.to_string()),
            AppError::WebFinger(_) | AppError::ActorFetch(_) | AppError::ActivitySend(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        record_error(&self, "unknown");

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Record error metric
pub(crate) fn record_error(error: &AppError, endpoint: &str) {
    use crate::metrics::ERRORS_TOTAL;
    ERRORS_TOTAL
        .with_label_values(&[error.kind(), endpoint])
        .inc();
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
