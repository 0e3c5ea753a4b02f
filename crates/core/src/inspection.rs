//! Inspection requests and their processing results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Payload carried by a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRequest {
    pub request_id: String,
    pub product_id: String,
    pub batch_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub measurements: BTreeMap<String, serde_json::Value>,
}

/// Verdict of a single inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Defect,
    Anomaly,
    Failure,
}

impl Outcome {
    /// Outcomes that warrant an operator alert.
    pub fn is_alerting(self) -> bool {
        matches!(self, Self::Defect | Self::Anomaly)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Defect => write!(f, "Defect"),
            Self::Anomaly => write!(f, "Anomaly"),
            Self::Failure => write!(f, "Failure"),
        }
    }
}

/// Produced once per successfully processed envelope; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Identity of the envelope this result was produced for.
    pub id: String,
    pub product_id: String,
    pub batch_id: String,
    pub outcome: Outcome,
    /// Confidence score in `0.0..=1.0`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect_type: Option<String>,
    pub inspected_at: Timestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_pascal_case() {
        assert_eq!(
            serde_json::to_value(Outcome::Anomaly).unwrap(),
            serde_json::json!("Anomaly")
        );
        let parsed: Outcome = serde_json::from_str("\"Defect\"").unwrap();
        assert_eq!(parsed, Outcome::Defect);
    }

    #[test]
    fn only_defects_and_anomalies_alert() {
        assert!(Outcome::Defect.is_alerting());
        assert!(Outcome::Anomaly.is_alerting());
        assert!(!Outcome::Success.is_alerting());
        assert!(!Outcome::Failure.is_alerting());
    }

    #[test]
    fn request_measurements_default_to_empty() {
        let req: InspectionRequest = serde_json::from_value(serde_json::json!({
            "request_id": "r-1",
            "product_id": "p-1",
            "batch_id": "b-1",
            "timestamp": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(req.measurements.is_empty());
    }
}
