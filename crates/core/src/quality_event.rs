//! Ingress validation for production-line quality events.
//!
//! The HTTP ingress accepts a [`QualityEventInput`], validates it and turns
//! it into the [`InspectionRequest`] that travels through the broker.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;
use crate::inspection::InspectionRequest;
use crate::types::Timestamp;

/// Statuses a line station may report.
pub const VALID_STATUSES: [&str; 4] = ["Pass", "Fail", "Warning", "Pending"];

/// A quality event as submitted by a production line.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QualityEventInput {
    /// Caller-supplied identity. Generated when absent.
    #[validate(length(min = 1, max = 128, message = "EventId must be 1-128 characters"))]
    pub event_id: Option<String>,

    #[validate(length(max = 100, message = "LineId cannot exceed 100 characters"))]
    #[serde(default)]
    pub line_id: String,

    #[validate(length(min = 1, max = 100, message = "ProductId is required (max 100 characters)"))]
    pub product_id: String,

    #[validate(length(min = 1, max = 100, message = "BatchId is required (max 100 characters)"))]
    pub batch_id: String,

    #[validate(length(max = 100, message = "StationId cannot exceed 100 characters"))]
    pub station_id: Option<String>,

    #[validate(length(min = 1, message = "At least one quality metric is required"))]
    pub quality_metrics: BTreeMap<String, f64>,

    #[validate(custom(function = "validate_status"))]
    pub status: String,

    pub timestamp: Option<Timestamp>,

    #[serde(default)]
    pub additional_data: Option<BTreeMap<String, serde_json::Value>>,
}

fn validate_status(status: &str) -> Result<(), ValidationError> {
    if VALID_STATUSES.contains(&status) {
        Ok(())
    } else {
        let mut err = ValidationError::new("status");
        err.message = Some("Status must be one of: Pass, Fail, Warning, Pending".into());
        Err(err)
    }
}

impl QualityEventInput {
    /// Validate the input and build the inspection request it describes.
    pub fn into_inspection_request(self) -> Result<InspectionRequest, CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let request_id = self
            .event_id
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        let mut measurements: BTreeMap<String, serde_json::Value> = self
            .quality_metrics
            .into_iter()
            .map(|(k, v)| (k, serde_json::json!(v)))
            .collect();
        measurements.insert("status".to_string(), serde_json::json!(self.status));
        if !self.line_id.is_empty() {
            measurements.insert("line_id".to_string(), serde_json::json!(self.line_id));
        }
        if let Some(station) = self.station_id {
            measurements.insert("station_id".to_string(), serde_json::json!(station));
        }
        if let Some(extra) = self.additional_data {
            measurements.insert("additional_data".to_string(), serde_json::json!(extra));
        }

        Ok(InspectionRequest {
            request_id,
            product_id: self.product_id,
            batch_id: self.batch_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            measurements,
        })
    }
}
