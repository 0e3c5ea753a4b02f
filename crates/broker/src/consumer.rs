//! Idempotent processing of request envelopes.

use std::sync::Arc;

use linewatch_core::envelope::MessageEnvelope;
use linewatch_core::error::{CoreError, PipelineError};
use linewatch_core::inspection::{InspectionRequest, ProcessingResult};
use linewatch_core::sink::ResultSink;
use linewatch_core::strategy::InspectionStrategy;
use tokio_util::sync::CancellationToken;

use crate::idempotency::{Admission, IdempotencyStore};

/// What happened to an envelope that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Processed(ProcessingResult),
    /// Already handled within the idempotency window; nothing was done.
    Duplicate,
}

/// Runs the inspection strategy at most once per envelope id within the
/// idempotency window and forwards results to the sink.
///
/// A failed or cancelled run releases its idempotency record so the
/// redelivered envelope is processed again.
pub struct IdempotentConsumer {
    strategy: Arc<dyn InspectionStrategy>,
    sink: Arc<dyn ResultSink>,
    idempotency: IdempotencyStore,
}

impl IdempotentConsumer {
    pub fn new(
        strategy: Arc<dyn InspectionStrategy>,
        sink: Arc<dyn ResultSink>,
        idempotency: IdempotencyStore,
    ) -> Self {
        Self {
            strategy,
            sink,
            idempotency,
        }
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    pub async fn handle(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, PipelineError> {
        let request: InspectionRequest = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| PipelineError::Poison(format!("invalid inspection request: {e}")))?;

        if let Admission::Duplicate { first_seen_at } =
            self.idempotency.check_and_insert(&envelope.id)
        {
            tracing::warn!(
                message_id = %envelope.id,
                %first_seen_at,
                "Duplicate message skipped",
            );
            return Ok(HandleOutcome::Duplicate);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.process(&request) => result,
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    message_id = %envelope.id,
                    outcome = %result.outcome,
                    confidence = result.confidence,
                    retry_count = envelope.retry_count,
                    "Inspection processed",
                );
                Ok(HandleOutcome::Processed(result))
            }
            Err(e) => {
                self.idempotency.release(&envelope.id);
                tracing::warn!(
                    message_id = %envelope.id,
                    retry_count = envelope.retry_count,
                    error = %e,
                    "Inspection failed",
                );
                Err(e)
            }
        }
    }

    async fn process(&self, request: &InspectionRequest) -> Result<ProcessingResult, PipelineError> {
        let result = self
            .strategy
            .inspect(request)
            .await
            .map_err(|e| match e {
                CoreError::Validation(msg) => PipelineError::Poison(msg),
                other => PipelineError::Transient(other.to_string()),
            })?;
        self.sink.deliver(&result).await?;
        Ok(result)
    }
}
