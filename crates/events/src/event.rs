use std::time::Duration;

use linewatch_core::inspection::ProcessingResult;
use linewatch_core::types::{to_chrono, SequenceNumber, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type of every notification carrying an inspection result.
pub const INSPECTION_UPDATE: &str = "InspectionUpdate";

/// A processing result stamped with its place in the notification sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub event_type: String,
    pub payload: ProcessingResult,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl NotificationEvent {
    pub fn inspection_update(
        sequence_number: SequenceNumber,
        payload: ProcessingResult,
        created_at: Timestamp,
        retention: Duration,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence_number,
            event_type: INSPECTION_UPDATE.to_string(),
            payload,
            created_at,
            expires_at: created_at + to_chrono(retention),
        }
    }
}
