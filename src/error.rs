use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid idempotency configuration: {0}")]
    Config(String),

    #[error("invalid idempotency key: {0}")]
    Extraction(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store error: {0}")]
    Store(String),

    #[error("idempotency record not found: {0}")]
    NotFound(String),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),

    #[error("request cancelled while waiting for the original response")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Store failures, as opposed to caller or record problems.
    pub fn is_store_error(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::Store(_) | AppError::NotFound(_))
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IDEMPOTENCY_CONFIG_ERROR"),
            AppError::Extraction(_) => (StatusCode::BAD_REQUEST, "INVALID_IDEMPOTENCY_KEY"),
            AppError::Redis(_) | AppError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "IDEMPOTENCY_STORE_UNAVAILABLE")
            }
            AppError::NotFound(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IDEMPOTENCY_RECORD_MISSING"),
            AppError::Serialization(_) | AppError::InvalidRecord(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "IDEMPOTENCY_RECORD_CORRUPT")
            }
            AppError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "IDEMPOTENCY_WAIT_CANCELLED"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("Idempotency request failed: {}", self);
        }

        let body = Json(json!({
            "code": code,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
