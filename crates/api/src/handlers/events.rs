//! Ingress: quality events submitted by production lines.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use linewatch_core::envelope::MessageEnvelope;
use linewatch_core::quality_event::QualityEventInput;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Identity under which an accepted event travels through the pipeline.
#[derive(Debug, Serialize)]
pub struct AcceptedEvent {
    pub event_id: String,
}

/// POST /events
///
/// Validate the event and publish it as an inspection request. Accepted
/// means the broker has the message; processing happens asynchronously.
pub async fn publish_event(
    State(state): State<AppState>,
    Json(input): Json<QualityEventInput>,
) -> AppResult<(StatusCode, Json<DataResponse<AcceptedEvent>>)> {
    let request = input.into_inspection_request()?;
    let envelope = MessageEnvelope::from_payload(request.request_id.clone(), &request)
        .map_err(|e| AppError::InternalError(format!("Failed to encode request: {e}")))?;

    state.publisher.publish(&envelope, &state.shutdown).await?;

    tracing::info!(
        event_id = %envelope.id,
        product_id = %request.product_id,
        batch_id = %request.batch_id,
        "Quality event accepted",
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: AcceptedEvent {
                event_id: envelope.id,
            },
        }),
    ))
}
