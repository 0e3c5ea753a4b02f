//! Tests for `AppError` → HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no server is
//! involved.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use linewatch_api::error::AppError;
use linewatch_core::error::{CoreError, PipelineError};

/// Helper: convert an `AppError` into its status, headers and parsed JSON body.
async fn error_to_response(
    err: AppError,
) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, headers, json)
}

#[tokio::test]
async fn not_found_error_returns_404() {
    let err = AppError::Core(CoreError::NotFound {
        entity: "Event",
        id: "E42".into(),
    });

    let (status, _, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "Event with id E42 not found");
}

#[tokio::test]
async fn validation_error_returns_400() {
    let err = AppError::Core(CoreError::Validation("ProductId is required".into()));

    let (status, _, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["error"], "ProductId is required");
}

#[tokio::test]
async fn broker_unavailable_returns_503_with_retry_after() {
    let err = AppError::Pipeline(PipelineError::BrokerUnavailable {
        retry_after: Duration::from_millis(12_300),
    });

    let (status, headers, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers["retry-after"], "13");
    assert_eq!(json["code"], "BROKER_UNAVAILABLE");
}

#[tokio::test]
async fn transient_failure_returns_503_without_internals() {
    let err = AppError::Pipeline(PipelineError::Transient(
        "publish of E1 failed after 3 attempts: connection refused".into(),
    ));

    let (status, headers, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.get("retry-after").is_none());
    assert_eq!(json["code"], "PUBLISH_FAILED");
    assert!(!json["error"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn integrity_violation_returns_500_with_sanitized_message() {
    let err = AppError::Pipeline(PipelineError::SequenceIntegrityViolation {
        sequence: 17,
        reason: "cache write rejected".into(),
    });

    let (status, _, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "SEQUENCE_INTEGRITY_VIOLATION");
    assert!(!json["error"].as_str().unwrap().contains("cache"));
}

#[tokio::test]
async fn bad_request_error_returns_400() {
    let err = AppError::BadRequest("invalid field value".into());

    let (status, _, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "invalid field value");
}

#[tokio::test]
async fn internal_error_hides_details() {
    let err = AppError::InternalError("secret stack trace".into());

    let (status, _, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert_eq!(json["error"], "An internal error occurred");
}
