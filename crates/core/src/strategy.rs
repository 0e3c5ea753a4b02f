//! Pluggable inspection strategies.
//!
//! The consumer only sees `Arc<dyn InspectionStrategy>`; swapping the
//! simulated strategy for a real inference client does not touch the
//! pipeline. Strategies must not reach into idempotency or sequencing state.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::CoreError;
use crate::inspection::{InspectionRequest, Outcome, ProcessingResult};

/// Version reported in result metadata by the simulated inspector.
pub const SIMULATED_INSPECTOR_VERSION: &str = "1.0.0";

/// Defect categories the simulated inspector can report.
pub const DEFECT_TYPES: [&str; 5] = ["Scratch", "Dent", "Misalignment", "Discoloration", "Crack"];

/// Turns an inspection request into a result.
#[async_trait]
pub trait InspectionStrategy: Send + Sync {
    /// Inspect a single request. An `Err` is a processing failure and feeds
    /// the retry / dead-letter cycle.
    async fn inspect(&self, request: &InspectionRequest) -> Result<ProcessingResult, CoreError>;
}

// ---------------------------------------------------------------------------
// SimulatedStrategy
// ---------------------------------------------------------------------------

/// Weighted random inspector: 70% success, 20% defect, 10% anomaly.
///
/// The RNG is private to the strategy. [`SimulatedStrategy::seeded`] makes
/// the outcome sequence reproducible for tests.
pub struct SimulatedStrategy {
    rng: Mutex<StdRng>,
}

impl SimulatedStrategy {
    /// Deterministic strategy for tests and replayable demos.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Strategy seeded from operating-system entropy.
    pub fn from_os_rng() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    fn roll(&self, request: &InspectionRequest) -> ProcessingResult {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let draw: f64 = rng.random();
        let outcome = if draw < 0.70 {
            Outcome::Success
        } else if draw < 0.90 {
            Outcome::Defect
        } else {
            Outcome::Anomaly
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "inspection_duration_ms".to_string(),
            serde_json::json!(rng.random_range(50..200)),
        );
        metadata.insert(
            "inspector_version".to_string(),
            serde_json::json!(SIMULATED_INSPECTOR_VERSION),
        );

        let mut defect_type = None;
        match outcome {
            Outcome::Defect => {
                let idx = rng.random_range(0..DEFECT_TYPES.len());
                defect_type = Some(DEFECT_TYPES[idx].to_string());
                metadata.insert(
                    "defect_severity".to_string(),
                    serde_json::json!(rng.random_range(1..10)),
                );
            }
            Outcome::Anomaly => {
                let score: f64 = rng.random();
                metadata.insert("anomaly_score".to_string(), serde_json::json!(score));
            }
            Outcome::Success | Outcome::Failure => {}
        }

        let confidence = 0.7 + rng.random::<f64>() * 0.3;

        ProcessingResult {
            id: request.request_id.clone(),
            product_id: request.product_id.clone(),
            batch_id: request.batch_id.clone(),
            outcome,
            confidence,
            defect_type,
            inspected_at: Utc::now(),
            metadata,
        }
    }
}

#[async_trait]
impl InspectionStrategy for SimulatedStrategy {
    async fn inspect(&self, request: &InspectionRequest) -> Result<ProcessingResult, CoreError> {
        Ok(self.roll(request))
    }
}

// ---------------------------------------------------------------------------
// FixedStrategy
// ---------------------------------------------------------------------------

/// Always reports the same outcome with full confidence.
#[derive(Debug, Clone, Copy)]
pub struct FixedStrategy {
    outcome: Outcome,
}

impl FixedStrategy {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl InspectionStrategy for FixedStrategy {
    async fn inspect(&self, request: &InspectionRequest) -> Result<ProcessingResult, CoreError> {
        Ok(ProcessingResult {
            id: request.request_id.clone(),
            product_id: request.product_id.clone(),
            batch_id: request.batch_id.clone(),
            outcome: self.outcome,
            confidence: 1.0,
            defect_type: None,
            inspected_at: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> InspectionRequest {
        InspectionRequest {
            request_id: id.to_string(),
            product_id: "P-100".to_string(),
            batch_id: "B-7".to_string(),
            timestamp: Utc::now(),
            measurements: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn same_seed_gives_same_outcomes() {
        let a = SimulatedStrategy::seeded(42);
        let b = SimulatedStrategy::seeded(42);

        for i in 0..50 {
            let req = request(&format!("r-{i}"));
            let ra = a.inspect(&req).await.unwrap();
            let rb = b.inspect(&req).await.unwrap();
            assert_eq!(ra.outcome, rb.outcome);
            assert_eq!(ra.confidence, rb.confidence);
            assert_eq!(ra.defect_type, rb.defect_type);
        }
    }

    #[tokio::test]
    async fn simulated_results_are_well_formed() {
        let strategy = SimulatedStrategy::seeded(7);

        for i in 0..200 {
            let req = request(&format!("r-{i}"));
            let result = strategy.inspect(&req).await.unwrap();

            assert_eq!(result.id, req.request_id);
            assert_eq!(result.product_id, "P-100");
            assert!((0.7..1.0).contains(&result.confidence));
            assert_ne!(result.outcome, Outcome::Failure);
            assert_eq!(
                result.metadata["inspector_version"],
                SIMULATED_INSPECTOR_VERSION
            );

            match result.outcome {
                Outcome::Defect => {
                    let kind = result.defect_type.as_deref().expect("defect type");
                    assert!(DEFECT_TYPES.contains(&kind));
                    assert!(result.metadata.contains_key("defect_severity"));
                }
                Outcome::Anomaly => {
                    assert!(result.defect_type.is_none());
                    assert!(result.metadata.contains_key("anomaly_score"));
                }
                _ => assert!(result.defect_type.is_none()),
            }
        }
    }

    #[tokio::test]
    async fn weights_roughly_hold_over_many_draws() {
        let strategy = SimulatedStrategy::seeded(1234);
        let mut success = 0;
        let total = 2000;

        for i in 0..total {
            let result = strategy.inspect(&request(&i.to_string())).await.unwrap();
            if result.outcome == Outcome::Success {
                success += 1;
            }
        }

        let ratio = success as f64 / total as f64;
        assert!((0.62..0.78).contains(&ratio), "success ratio {ratio}");
    }

    #[tokio::test]
    async fn fixed_strategy_echoes_identity() {
        let strategy = FixedStrategy::new(Outcome::Defect);
        let result = strategy.inspect(&request("abc")).await.unwrap();
        assert_eq!(result.id, "abc");
        assert_eq!(result.outcome, Outcome::Defect);
        assert_eq!(result.confidence, 1.0);
    }
}
