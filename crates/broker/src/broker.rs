//! Capability interface over a durable, topic-routed message broker.
//!
//! The pipeline needs very little from a broker: declare exchanges and
//! queues, publish persistent messages, and pull deliveries with a prefetch
//! limit that are then explicitly acknowledged. Anything that provides that
//! can sit behind [`Connector`] / [`Channel`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use linewatch_core::envelope::HEADER_RETRY_COUNT;
use linewatch_core::types::Timestamp;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Message headers. Values are JSON so integer counters and string reasons
/// share one map.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Per-message properties carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    /// Survive a broker restart.
    pub persistent: bool,
    pub headers: Headers,
}

impl MessageProperties {
    /// The redelivery counter. Missing or malformed headers read as `0`.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(HEADER_RETRY_COUNT) {
            Some(serde_json::Value::Number(n)) => {
                n.as_u64().and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
            }
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn set_header(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.headers.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-separated patterns with `*` (one word) and `#` (zero or more).
    Topic,
}

/// Where a queue sends messages that are rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Establishes channels to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}

/// An open channel on a broker connection.
///
/// All declarations are idempotent: re-declaring an existing exchange,
/// queue or binding with the same arguments is a no-op.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish to `exchange`. The empty exchange name routes directly to the
    /// queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue`. At most `prefetch` deliveries are
    /// outstanding (unsettled) at any time.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;
}

/// Deliveries for one consumer. The stream ends when the channel closes.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject. `requeue = false` routes the message to the queue's
    /// dead-letter target, if any.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer.
///
/// Must be settled exactly once via [`Delivery::ack`] or [`Delivery::nack`].
/// A delivery dropped unsettled is returned to its queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            properties,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.properties.message_id)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
