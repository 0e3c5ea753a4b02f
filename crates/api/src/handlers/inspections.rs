//! Inspection results: direct submission, catch-up and sequence queries.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use linewatch_core::inspection::ProcessingResult;
use linewatch_core::types::SequenceNumber;
use linewatch_events::{CatchUp, NotificationEvent};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Query parameters for the missed-events endpoint.
#[derive(Debug, Deserialize)]
pub struct MissedEventsQuery {
    /// Last sequence the client has seen; events after it are returned.
    pub last_sequence: SequenceNumber,
    /// Upper bound on returned events (default and ceiling: the configured
    /// catch-up cap).
    pub max_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LatestSequence {
    pub sequence_number: SequenceNumber,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /inspections/results
///
/// Sequence, store and fan out a processing result.
pub async fn submit_result(
    State(state): State<AppState>,
    Json(result): Json<ProcessingResult>,
) -> AppResult<(StatusCode, Json<DataResponse<NotificationEvent>>)> {
    if result.id.trim().is_empty() {
        return Err(AppError::BadRequest("Result id is required".into()));
    }
    if !(0.0..=1.0).contains(&result.confidence) {
        return Err(AppError::BadRequest(
            "Confidence must be between 0 and 1".into(),
        ));
    }

    let event = state.notifier.notify(result).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: event })))
}

/// GET /inspections/missed-events?last_sequence=N&max_count=M
pub async fn missed_events(
    State(state): State<AppState>,
    Query(query): Query<MissedEventsQuery>,
) -> AppResult<Json<DataResponse<CatchUp>>> {
    if query.last_sequence < 0 {
        return Err(AppError::BadRequest(
            "last_sequence cannot be negative".into(),
        ));
    }

    let max_count = query.max_count.unwrap_or(usize::MAX);
    let events = state
        .notifier
        .get_since(query.last_sequence, max_count)
        .await?;
    let latest = state.notifier.latest().await?;

    Ok(Json(DataResponse {
        data: CatchUp { events, latest },
    }))
}

/// GET /inspections/latest-sequence
pub async fn latest_sequence(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<LatestSequence>>> {
    let sequence_number = state.notifier.latest().await?;
    Ok(Json(DataResponse {
        data: LatestSequence { sequence_number },
    }))
}
