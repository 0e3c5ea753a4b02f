//! Mapping between [`MessageEnvelope`] and broker messages.
//!
//! The body is the JSON payload alone; identity, creation time and the
//! redelivery counter travel as message properties so a redelivery never
//! has to re-encode the body.

use chrono::Utc;
use linewatch_core::envelope::{MessageEnvelope, CONTENT_TYPE_JSON, HEADER_RETRY_COUNT};
use linewatch_core::error::PipelineError;

use crate::broker::MessageProperties;

/// Encode an envelope as a persistent JSON message.
pub fn encode(envelope: &MessageEnvelope) -> Result<(Vec<u8>, MessageProperties), PipelineError> {
    let body = serde_json::to_vec(&envelope.payload)
        .map_err(|e| PipelineError::Poison(format!("payload not serializable: {e}")))?;

    let mut properties = MessageProperties {
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
        message_id: Some(envelope.id.clone()),
        timestamp: Some(envelope.created_at),
        persistent: true,
        ..Default::default()
    };
    properties.set_header(HEADER_RETRY_COUNT, envelope.retry_count);

    Ok((body, properties))
}

/// Rebuild the envelope from a delivered message.
///
/// A missing message id or a body that is not JSON can never be processed
/// and is reported as [`PipelineError::Poison`].
pub fn decode(body: &[u8], properties: &MessageProperties) -> Result<MessageEnvelope, PipelineError> {
    let id = properties
        .message_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PipelineError::Poison("message has no id".into()))?;

    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Poison(format!("body is not valid JSON: {e}")))?;

    Ok(MessageEnvelope {
        id,
        payload,
        retry_count: properties.retry_count(),
        created_at: properties.timestamp.unwrap_or_else(Utc::now),
    })
}
