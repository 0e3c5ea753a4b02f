//! Where processed results go once the consumer is done with them.

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::inspection::ProcessingResult;

/// Receives every successfully produced [`ProcessingResult`].
///
/// A failing sink is treated by the consumer exactly like a failing
/// strategy: the idempotency record is released and the message enters the
/// retry / dead-letter cycle.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &ProcessingResult) -> Result<(), PipelineError>;
}
