//! The unit of work carried through the broker.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Header carrying the redelivery counter.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";

/// Header set on dead-lettered messages explaining why they were parked.
pub const HEADER_DEAD_LETTER_REASON: &str = "x-dead-letter-reason";

/// Content type of every envelope body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message as handed to the broker by a producer.
///
/// `id` is caller-supplied, globally unique and immutable; it is the
/// idempotency key the consumer deduplicates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub created_at: Timestamp,
}

impl MessageEnvelope {
    /// Wrap a payload for first delivery.
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Serialize any payload type into a fresh envelope.
    pub fn from_payload<T: Serialize>(
        id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, serde_json::to_value(payload)?))
    }

    /// The envelope a redelivery cycle republishes: same identity and
    /// payload, counter bumped by exactly one.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}
