//! Resilient publishing: one lazily established channel shared by all
//! callers, bounded retries with exponential backoff, and a circuit breaker
//! that fails fast while the broker is down.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use linewatch_core::clock::Clock;
use linewatch_core::envelope::MessageEnvelope;
use linewatch_core::error::PipelineError;
use linewatch_core::inspection::ProcessingResult;
use linewatch_core::sink::ResultSink;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::{Channel, Connector, MessageProperties};
use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot};
use crate::error::BrokerError;
use crate::retry::RetryPolicy;
use crate::topology::{Route, Topology};
use crate::wire;

pub struct ResilientPublisher {
    connector: Arc<dyn Connector>,
    topology: Topology,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    /// Serialises connection establishment.
    connect_gate: Mutex<()>,
}

impl ResilientPublisher {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        retry: RetryPolicy,
        circuit: CircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            topology,
            retry,
            breaker: CircuitBreaker::new(circuit, clock),
            channel: RwLock::new(None),
            connect_gate: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Publish an inspection request to the request exchange.
    pub async fn publish(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let route = self.topology.requests_route();
        self.publish_to(&route, envelope, cancel).await
    }

    /// Publish `envelope` to `route`.
    ///
    /// Fails with [`PipelineError::BrokerUnavailable`] without any I/O while
    /// the circuit is open, and with [`PipelineError::Transient`] once
    /// `max_attempts` attempts have failed or `cancel` fires.
    pub async fn publish_to(
        &self,
        route: &Route,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let (body, properties) = wire::encode(envelope)?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled(&envelope.id));
            }

            let permit = self.breaker.try_acquire().map_err(|rejected| {
                tracing::debug!(
                    message_id = %envelope.id,
                    retry_after_secs = rejected.retry_after.as_secs(),
                    "Circuit open, publish rejected",
                );
                PipelineError::BrokerUnavailable {
                    retry_after: rejected.retry_after,
                }
            })?;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&envelope.id)),
                result = self.attempt(route, body.clone(), properties.clone()) => result,
            };

            match result {
                Ok(()) => {
                    permit.success();
                    tracing::debug!(
                        message_id = %envelope.id,
                        exchange = %route.exchange,
                        routing_key = %route.routing_key,
                        attempt,
                        "Message published",
                    );
                    return Ok(());
                }
                Err(e) => {
                    permit.failure();
                    if e.invalidates_channel() {
                        self.invalidate_channel();
                    }
                    last_error = e.to_string();

                    if attempt == max_attempts {
                        break;
                    }

                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        message_id = %envelope.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish attempt failed, retrying",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(cancelled(&envelope.id)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::error!(
            message_id = %envelope.id,
            attempts = max_attempts,
            error = %last_error,
            "Publish failed, retries exhausted",
        );
        Err(PipelineError::Transient(format!(
            "publish of {} failed after {max_attempts} attempts: {last_error}",
            envelope.id
        )))
    }

    async fn attempt(
        &self,
        route: &Route,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel
            .publish(&route.exchange, &route.routing_key, body, properties)
            .await
    }

    fn cached_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|ch| ch.is_open())
            .cloned()
    }

    /// The shared channel, connecting on first use or after it closed.
    /// Concurrent callers wait on the gate; only one connects.
    async fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if let Some(ch) = self.cached_channel() {
            return Ok(ch);
        }

        let _gate = self.connect_gate.lock().await;
        if let Some(ch) = self.cached_channel() {
            return Ok(ch);
        }

        tracing::info!(exchange = %self.topology.exchange, "Connecting publisher to broker");
        let channel = self.connector.connect().await?;
        self.topology.declare(channel.as_ref()).await?;

        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&channel));
        Ok(channel)
    }

    fn invalidate_channel(&self) {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn cancelled(message_id: &str) -> PipelineError {
    PipelineError::Transient(format!("publish of {message_id} cancelled"))
}

// ---------------------------------------------------------------------------
// QueueResultSink
// ---------------------------------------------------------------------------

/// Hands processing results to the results queue through the publisher.
pub struct QueueResultSink {
    publisher: Arc<ResilientPublisher>,
    cancel: CancellationToken,
}

impl QueueResultSink {
    pub fn new(publisher: Arc<ResilientPublisher>, cancel: CancellationToken) -> Self {
        Self { publisher, cancel }
    }
}

#[async_trait]
impl ResultSink for QueueResultSink {
    async fn deliver(&self, result: &ProcessingResult) -> Result<(), PipelineError> {
        let envelope = MessageEnvelope::from_payload(result.id.clone(), result)
            .map_err(|e| PipelineError::Poison(e.to_string()))?;
        let route = self.publisher.topology().results_route();
        self.publisher
            .publish_to(&route, &envelope, &self.cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use linewatch_core::clock::ManualClock;

    use super::*;
    use crate::memory::InMemoryBroker;

    fn publisher(broker: &InMemoryBroker) -> ResilientPublisher {
        ResilientPublisher::new(
            Arc::new(broker.clone()),
            Topology::default(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            CircuitConfig::default(),
            Arc::new(ManualClock::new()),
        )
    }

    #[tokio::test]
    async fn publishes_to_request_queue() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let env = MessageEnvelope::new("E1", serde_json::json!({"a": 1}));

        publisher.publish(&env, &CancellationToken::new()).await.unwrap();

        let msgs = broker.take_messages("inspection-requests");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].properties.message_id.as_deref(), Some("E1"));
        assert_eq!(msgs[0].properties.retry_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let env = MessageEnvelope::new("E1", serde_json::json!({}));
        publisher.publish(&env, &CancellationToken::new()).await.unwrap();

        broker.fail_next_publishes(2);
        publisher.publish(&env, &CancellationToken::new()).await.unwrap();

        assert_eq!(broker.publish_attempts(), 4);
        assert_eq!(broker.queue_depth("inspection-requests"), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_transient() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let env = MessageEnvelope::new("E1", serde_json::json!({}));
        publisher.publish(&env, &CancellationToken::new()).await.unwrap();
        broker.fail_next_publishes(10);

        assert_matches!(
            publisher.publish(&env, &CancellationToken::new()).await,
            Err(PipelineError::Transient(msg)) if msg.contains("after 3 attempts")
        );
        assert_eq!(broker.publish_attempts(), 4);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_io() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = publisher
            .publish(&MessageEnvelope::new("E1", serde_json::json!({})), &cancel)
            .await;
        assert_matches!(result, Err(PipelineError::Transient(_)));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn result_sink_targets_results_queue() {
        let broker = InMemoryBroker::new();
        let sink = QueueResultSink::new(Arc::new(publisher(&broker)), CancellationToken::new());
        let result = ProcessingResult {
            id: "E9".into(),
            product_id: "P".into(),
            batch_id: "B".into(),
            outcome: linewatch_core::inspection::Outcome::Success,
            confidence: 0.9,
            defect_type: None,
            inspected_at: chrono::Utc::now(),
            metadata: Default::default(),
        };

        sink.deliver(&result).await.unwrap();

        let msgs = broker.take_messages("inspection-results");
        assert_eq!(msgs.len(), 1);
        let decoded: ProcessingResult = serde_json::from_slice(&msgs[0].body).unwrap();
        assert_eq!(decoded, result);
    }
}
