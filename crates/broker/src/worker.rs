//! Queue worker: pulls request deliveries and settles each one.
//!
//! | handler result            | settlement                                     |
//! |---------------------------|------------------------------------------------|
//! | processed / duplicate     | ack                                            |
//! | cancelled                 | nack + requeue (redelivered unchanged)         |
//! | poison                    | publish to DLQ (`poison`), ack                 |
//! | other, count < max        | republish with `x-retry-count + 1`, ack        |
//! | other, count >= max       | publish to DLQ (`retry-exhausted`), ack        |
//!
//! When the republish itself fails the delivery is nacked instead: with
//! requeue for retries, without requeue (broker-side dead-lettering) for
//! dead letters.

use std::sync::Arc;

use linewatch_core::envelope::{MessageEnvelope, HEADER_DEAD_LETTER_REASON};
use linewatch_core::error::PipelineError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{Channel, Connector, Delivery, DeliveryStream};
use crate::consumer::{HandleOutcome, IdempotentConsumer};
use crate::reconnect::{reconnect_loop, ReconnectConfig};
use crate::topology::Topology;
use crate::wire;

/// Default bound on redeliveries before a message is dead-lettered.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum unsettled deliveries in flight.
    pub prefetch: u16,
    /// Redeliveries allowed before dead-lettering.
    pub max_retry_attempts: u32,
    pub reconnect: ReconnectConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    Poison,
    RetryExhausted,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poison => "poison",
            Self::RetryExhausted => "retry-exhausted",
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Duplicate,
    /// Republished for another attempt carrying `retry_count`.
    Retried { retry_count: u32 },
    DeadLettered(DeadLetterReason),
    /// Returned to the queue untouched.
    Requeued,
}

pub struct QueueWorker {
    connector: Arc<dyn Connector>,
    topology: Topology,
    consumer: Arc<IdempotentConsumer>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        consumer: Arc<IdempotentConsumer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            connector,
            topology,
            consumer,
            config,
        }
    }

    /// Consume the request queue until `cancel` fires, reconnecting
    /// whenever the channel drops. In-flight deliveries are drained
    /// before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            queue = %self.topology.request_queue,
            prefetch = self.config.prefetch,
            "Queue worker started",
        );

        loop {
            let Some(channel) = reconnect_loop(
                self.connector.as_ref(),
                &self.topology,
                &self.config.reconnect,
                &cancel,
            )
            .await
            else {
                break;
            };

            match channel
                .consume(&self.topology.request_queue, self.config.prefetch)
                .await
            {
                Ok(deliveries) => {
                    Arc::clone(&self)
                        .drain(Arc::clone(&channel), deliveries, &cancel)
                        .await;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to start consuming"),
            }

            if cancel.is_cancelled() {
                break;
            }
            tracing::warn!("Delivery stream ended, reconnecting");
        }

        tracing::info!("Queue worker stopped");
    }

    async fn drain(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        mut deliveries: DeliveryStream,
        cancel: &CancellationToken,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery task panicked");
                    }
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => {
                        let worker = Arc::clone(&self);
                        let channel = Arc::clone(&channel);
                        let cancel = cancel.clone();
                        in_flight.spawn(async move {
                            worker.settle(channel.as_ref(), delivery, &cancel).await
                        });
                    }
                    None => break,
                },
            }
        }

        while in_flight.join_next().await.is_some() {}
    }

    /// Run one delivery through the consumer and settle it with the broker.
    pub async fn settle(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Settlement {
        let envelope = match wire::decode(&delivery.body, &delivery.properties) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Undecodable message",
                );
                return self
                    .dead_letter(channel, delivery, DeadLetterReason::Poison)
                    .await;
            }
        };

        match self.consumer.handle(&envelope, cancel).await {
            Ok(HandleOutcome::Processed(_)) => {
                ack(delivery).await;
                Settlement::Acked
            }
            Ok(HandleOutcome::Duplicate) => {
                ack(delivery).await;
                Settlement::Duplicate
            }
            Err(PipelineError::Cancelled) => {
                nack(delivery, true).await;
                Settlement::Requeued
            }
            Err(PipelineError::Poison(reason)) => {
                tracing::error!(message_id = %envelope.id, %reason, "Poison message");
                self.dead_letter(channel, delivery, DeadLetterReason::Poison)
                    .await
            }
            Err(_) if envelope.retry_count < self.config.max_retry_attempts => {
                self.redeliver(channel, delivery, &envelope).await
            }
            Err(e) => {
                let exhausted = PipelineError::RetryExhausted {
                    attempts: envelope.retry_count,
                };
                tracing::error!(
                    message_id = %envelope.id,
                    error = %exhausted,
                    cause = %e,
                    "Retries exhausted, dead-lettering",
                );
                self.dead_letter(channel, delivery, DeadLetterReason::RetryExhausted)
                    .await
            }
        }
    }

    async fn redeliver(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        envelope: &MessageEnvelope,
    ) -> Settlement {
        let next = envelope.next_attempt();
        let route = self.topology.redelivery_route();

        let published = match wire::encode(&next) {
            Ok((body, properties)) => channel
                .publish(&route.exchange, &route.routing_key, body, properties)
                .await
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                tracing::info!(
                    message_id = %next.id,
                    retry_count = next.retry_count,
                    max_retry_attempts = self.config.max_retry_attempts,
                    "Message scheduled for redelivery",
                );
                ack(delivery).await;
                Settlement::Retried {
                    retry_count: next.retry_count,
                }
            }
            Err(e) => {
                tracing::warn!(message_id = %next.id, error = %e, "Redelivery publish failed, requeueing");
                nack(delivery, true).await;
                Settlement::Requeued
            }
        }
    }

    async fn dead_letter(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
        reason: DeadLetterReason,
    ) -> Settlement {
        let mut properties = delivery.properties.clone();
        properties.set_header(HEADER_DEAD_LETTER_REASON, reason.as_str());
        let route = self.topology.dead_letter_route();

        let published = channel
            .publish(
                &route.exchange,
                &route.routing_key,
                delivery.body.clone(),
                properties,
            )
            .await;

        match published {
            Ok(()) => {
                tracing::warn!(
                    message_id = ?delivery.properties.message_id,
                    reason = reason.as_str(),
                    dlq = %self.topology.dead_letter_queue,
                    "Message dead-lettered",
                );
                ack(delivery).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dead-letter publish failed, rejecting");
                nack(delivery, false).await;
            }
        }
        Settlement::DeadLettered(reason)
    }
}

async fn ack(delivery: Delivery) {
    let tag = delivery.delivery_tag;
    if let Err(e) = delivery.ack().await {
        tracing::warn!(delivery_tag = tag, error = %e, "Ack failed");
    }
}

async fn nack(delivery: Delivery, requeue: bool) {
    let tag = delivery.delivery_tag;
    if let Err(e) = delivery.nack(requeue).await {
        tracing::warn!(delivery_tag = tag, requeue, error = %e, "Nack failed");
    }
}
