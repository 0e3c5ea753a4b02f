use std::time::Duration;

use crate::types::SequenceNumber;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy shared by every pipeline component.
///
/// A duplicate delivery is deliberately absent: it is an expected outcome,
/// reported as a value (`Admission::Duplicate`, `HandleOutcome::Duplicate`)
/// rather than an error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// Retryable I/O failure; surfaced once local retries are exhausted.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The publisher's circuit breaker is open. No I/O was attempted.
    #[error("Broker unavailable, retry after {}s", retry_after.as_secs())]
    BrokerUnavailable { retry_after: Duration },

    /// The message can never be processed (undeserializable or invalid).
    #[error("Poison message: {0}")]
    Poison(String),

    /// The redelivery counter reached the configured maximum.
    #[error("Retry attempts exhausted after {attempts} redeliveries")]
    RetryExhausted { attempts: u32 },

    /// An allocated sequence number could not be persisted. Fatal: the
    /// gap-free catch-up guarantee no longer holds.
    #[error("Sequence integrity violation at #{sequence}: {reason}")]
    SequenceIntegrityViolation {
        sequence: SequenceNumber,
        reason: String,
    },

    /// Work was abandoned because the caller cancelled it (e.g. shutdown).
    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether a later attempt of the same work could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::BrokerUnavailable { .. } | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_and_integrity_are_not_retryable() {
        assert!(!PipelineError::Poison("bad json".into()).is_retryable());
        assert!(!PipelineError::SequenceIntegrityViolation {
            sequence: 4,
            reason: "write failed".into()
        }
        .is_retryable());
        assert!(!PipelineError::RetryExhausted { attempts: 3 }.is_retryable());
    }

    #[test]
    fn transient_failures_are_retryable() {
        assert!(PipelineError::Transient("timeout".into()).is_retryable());
        assert!(PipelineError::BrokerUnavailable {
            retry_after: Duration::from_secs(30)
        }
        .is_retryable());
    }

    #[test]
    fn broker_unavailable_message_mentions_retry_after() {
        let err = PipelineError::BrokerUnavailable {
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.to_string(), "Broker unavailable, retry after 12s");
    }
}
