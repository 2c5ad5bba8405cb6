use crate::idempotency::StoreError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request validation failed")]
    Validation { issues: Vec<String> },

    #[error("idempotency key reused with a different request")]
    IdempotencyConflict,

    /// Another execution holds the key; the client should retry later.
    #[error("idempotent request still in progress")]
    IdempotencyInProgress { retry_after_secs: u64 },

    #[error("{code}")]
    NotFound { code: &'static str },

    #[error("{code}")]
    BadRequest { code: &'static str },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(issues: Vec<String>) -> Self {
        ApiError::Validation { issues }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::IdempotencyConflict | ApiError::IdempotencyInProgress { .. } => {
                StatusCode::CONFLICT
            }
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body sent to the client. Server-side causes are never exposed.
    pub fn body(&self) -> Value {
        match self {
            ApiError::Validation { issues } => json!({
                "error": "validation_error",
                "issues": issues
            }),
            ApiError::IdempotencyConflict => json!({
                "error": "idempotency_key_conflict",
                "message": "Idempotency-Key was already used with a different request"
            }),
            ApiError::IdempotencyInProgress { .. } => json!({
                "error": "idempotency_in_progress",
                "message": "A request with this Idempotency-Key is still being processed"
            }),
            ApiError::NotFound { code } | ApiError::BadRequest { code } => {
                json!({ "error": code })
            }
            ApiError::RateLimited { .. } => json!({ "error": "rate_limited" }),
            ApiError::Store(_) | ApiError::Internal(_) => json!({
                "error": "internal_server_error",
                "message": "An unexpected error occurred."
            }),
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::IdempotencyInProgress { retry_after_secs }
            | ApiError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let mut response = (status, Json(self.body())).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
