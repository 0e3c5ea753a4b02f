use std::time::Duration;

use axum::http::header::RETRY_AFTER;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use linewatch_core::error::{CoreError, PipelineError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`PipelineError`] and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON error
/// responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `linewatch_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A publish, consume or sequencing failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Pipeline errors ---
            AppError::Pipeline(err) => match err {
                PipelineError::BrokerUnavailable { retry_after: wait } => {
                    retry_after = Some(*wait);
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "BROKER_UNAVAILABLE",
                        err.to_string(),
                    )
                }
                PipelineError::Transient(msg) => {
                    tracing::warn!(error = %msg, "Publish failed");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "PUBLISH_FAILED",
                        "The event could not be published, try again later".to_string(),
                    )
                }
                PipelineError::Poison(msg) => {
                    (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", msg.clone())
                }
                PipelineError::RetryExhausted { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "RETRY_EXHAUSTED",
                    err.to_string(),
                ),
                PipelineError::SequenceIntegrityViolation { sequence, reason } => {
                    tracing::error!(sequence, reason = %reason, "Sequence integrity violation");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "SEQUENCE_INTEGRITY_VIOLATION",
                        "Event sequencing is unavailable".to_string(),
                    )
                }
                PipelineError::Cancelled => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SHUTTING_DOWN",
                    "The server is shutting down".to_string(),
                ),
            },

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(wait) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, retry_after_secs(wait).into());
        }
        response
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Whole seconds, rounded up and never zero.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
