#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use linewatch_core::envelope::MessageEnvelope;
use linewatch_core::error::{CoreError, PipelineError};
use linewatch_core::inspection::{InspectionRequest, ProcessingResult};
use linewatch_core::sink::ResultSink;
use linewatch_core::strategy::InspectionStrategy;

/// Poll `check` until it holds or five seconds elapse.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn request_envelope(id: &str) -> MessageEnvelope {
    MessageEnvelope::from_payload(
        id,
        &InspectionRequest {
            request_id: id.to_string(),
            product_id: "P-100".into(),
            batch_id: "B-7".into(),
            timestamp: chrono::Utc::now(),
            measurements: Default::default(),
        },
    )
    .unwrap()
}

/// Collects delivered results.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<ProcessingResult>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn deliver(&self, result: &ProcessingResult) -> Result<(), PipelineError> {
        self.delivered.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Always fails and counts invocations.
#[derive(Default)]
pub struct FailingStrategy {
    pub calls: AtomicUsize,
}

impl FailingStrategy {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InspectionStrategy for FailingStrategy {
    async fn inspect(&self, _: &InspectionRequest) -> Result<ProcessingResult, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::Internal("inspector unreachable".into()))
    }
}

/// Never completes.
pub struct StalledStrategy;

#[async_trait]
impl InspectionStrategy for StalledStrategy {
    async fn inspect(&self, _: &InspectionRequest) -> Result<ProcessingResult, CoreError> {
        std::future::pending().await
    }
}
