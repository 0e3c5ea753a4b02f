//! Relay from the results queue into the Fan-Out Notifier.
//!
//! Deliveries are handled one at a time so the notifier sequences results
//! in queue order. Result ids already sequenced within the idempotency
//! window are acked without being sequenced again.
//!
//! | notify result                  | settlement                           |
//! |--------------------------------|--------------------------------------|
//! | sequenced                      | ack                                  |
//! | result id already sequenced    | ack                                  |
//! | undecodable result             | nack, dead-lettered by the broker    |
//! | sequence integrity violation   | nack + requeue, relay halts          |
//! | other failure                  | nack + requeue after a pause         |

use std::sync::Arc;
use std::time::Duration;

use linewatch_broker::reconnect::{reconnect_loop, ReconnectConfig};
use linewatch_broker::{wire, Admission, Connector, Delivery, IdempotencyStore, Topology};
use linewatch_core::error::PipelineError;
use linewatch_core::inspection::ProcessingResult;
use linewatch_core::types::SequenceNumber;
use linewatch_events::FanOutNotifier;
use tokio_util::sync::CancellationToken;

/// Pause before a failed result goes back on the queue.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(SequenceNumber),
    Duplicate,
    DeadLettered,
    Requeued,
    /// The notifier is faulted; the result was returned to the queue.
    Halted,
}

pub struct ResultRelay {
    connector: Arc<dyn Connector>,
    topology: Topology,
    notifier: Arc<FanOutNotifier>,
    sequenced: IdempotencyStore,
    prefetch: u16,
    reconnect: ReconnectConfig,
}

impl ResultRelay {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        notifier: Arc<FanOutNotifier>,
        sequenced: IdempotencyStore,
        prefetch: u16,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            topology,
            notifier,
            sequenced,
            prefetch,
            reconnect,
        }
    }

    /// Consume the results queue until `cancel` fires, reconnecting
    /// whenever the channel drops.
    ///
    /// Stops for good once the notifier latches an integrity fault.
    /// Unsettled results stay on the queue for an operator to recover.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(queue = %self.topology.results_queue, "Result relay started");

        'relay: loop {
            if self.halt_on_fault() {
                break;
            }

            let Some(channel) = reconnect_loop(
                self.connector.as_ref(),
                &self.topology,
                &self.reconnect,
                &cancel,
            )
            .await
            else {
                break;
            };

            match channel
                .consume(&self.topology.results_queue, self.prefetch)
                .await
            {
                Ok(mut deliveries) => loop {
                    let delivery = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = deliveries.recv() => match next {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    };
                    if self.relay(delivery, &cancel).await == RelayOutcome::Halted {
                        self.halt_on_fault();
                        break 'relay;
                    }
                },
                Err(e) => tracing::warn!(error = %e, "Failed to start consuming results"),
            }

            if cancel.is_cancelled() {
                break;
            }
            tracing::warn!("Result stream ended, reconnecting");
        }

        tracing::info!("Result relay stopped");
    }

    fn halt_on_fault(&self) -> bool {
        match self.notifier.integrity_fault() {
            Some(fault) => {
                tracing::error!(
                    queue = %self.topology.results_queue,
                    error = %fault,
                    "Notifier faulted, result relay halted; results remain queued",
                );
                true
            }
            None => false,
        }
    }

    /// Hand one result delivery to the notifier and settle it.
    pub async fn relay(&self, delivery: Delivery, cancel: &CancellationToken) -> RelayOutcome {
        let result = wire::decode(&delivery.body, &delivery.properties).and_then(|envelope| {
            serde_json::from_value::<ProcessingResult>(envelope.payload)
                .map_err(|e| PipelineError::Poison(format!("not a processing result: {e}")))
        });
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    message_id = ?delivery.properties.message_id,
                    error = %e,
                    "Dead-lettering undecodable result",
                );
                settle(delivery, false).await;
                return RelayOutcome::DeadLettered;
            }
        };

        if self.notifier.integrity_fault().is_some() {
            settle(delivery, true).await;
            return RelayOutcome::Halted;
        }

        let id = result.id.clone();
        if let Admission::Duplicate { first_seen_at } = self.sequenced.check_and_insert(&id) {
            tracing::info!(result_id = %id, %first_seen_at, "Result already sequenced, acking");
            ack(delivery, &id).await;
            return RelayOutcome::Duplicate;
        }

        match self.notifier.notify(result).await {
            Ok(event) => {
                ack(delivery, &id).await;
                RelayOutcome::Delivered(event.sequence_number)
            }
            Err(e @ PipelineError::SequenceIntegrityViolation { .. }) => {
                tracing::error!(result_id = %id, error = %e, "Notifier faulted, returning result to queue");
                self.sequenced.release(&id);
                settle(delivery, true).await;
                RelayOutcome::Halted
            }
            Err(e) => {
                tracing::warn!(result_id = %id, error = %e, "Notify failed, requeueing result");
                self.sequenced.release(&id);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(REQUEUE_DELAY) => {}
                }
                settle(delivery, true).await;
                RelayOutcome::Requeued
            }
        }
    }
}

async fn ack(delivery: Delivery, result_id: &str) {
    if let Err(e) = delivery.ack().await {
        tracing::warn!(result_id, error = %e, "Failed to ack relayed result");
    }
}

async fn settle(delivery: Delivery, requeue: bool) {
    let tag = delivery.delivery_tag;
    if let Err(e) = delivery.nack(requeue).await {
        tracing::warn!(delivery_tag = tag, requeue, error = %e, "Failed to nack result");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use linewatch_broker::{Channel, DeliveryStream, InMemoryBroker};
    use linewatch_core::clock::ManualClock;
    use linewatch_core::envelope::MessageEnvelope;
    use linewatch_core::inspection::Outcome;
    use linewatch_events::store::DEFAULT_RETENTION;
    use linewatch_events::{
        CacheError, EventCache, EventStore, InMemoryEventCache, NotificationBus, Sequencer,
    };

    use super::*;

    /// In-memory cache that can be told to reject every `set`.
    struct RejectingCache {
        inner: InMemoryEventCache,
        reject_sets: AtomicBool,
    }

    #[async_trait]
    impl EventCache for RejectingCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: String,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            if self.reject_sets.load(Ordering::SeqCst) {
                return Err(CacheError::Unavailable("disk full".into()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn incr(&self, key: &str) -> Result<i64, CacheError> {
            self.inner.incr(key).await
        }

        async fn set_max(&self, key: &str, value: i64) -> Result<i64, CacheError> {
            self.inner.set_max(key, value).await
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        channel: Arc<dyn Channel>,
        topology: Topology,
        cache: Arc<RejectingCache>,
        notifier: Arc<FanOutNotifier>,
        relay: ResultRelay,
    }

    async fn harness() -> Harness {
        let clock = ManualClock::new();
        let cache = Arc::new(RejectingCache {
            inner: InMemoryEventCache::new(Arc::new(clock.clone())),
            reject_sets: AtomicBool::new(false),
        });
        let notifier = Arc::new(FanOutNotifier::new(
            Sequencer::new(cache.clone()),
            EventStore::new(cache.clone(), DEFAULT_RETENTION),
            Arc::new(clock.clone()),
            Arc::new(NotificationBus::default()),
        ));

        let broker = InMemoryBroker::new();
        let topology = Topology::default();
        let channel = broker.connect().await.unwrap();
        topology.declare(channel.as_ref()).await.unwrap();

        let relay = ResultRelay::new(
            Arc::new(broker.clone()),
            topology.clone(),
            Arc::clone(&notifier),
            IdempotencyStore::new(Duration::from_secs(3600), Arc::new(clock)),
            1,
            ReconnectConfig::default(),
        );

        Harness {
            broker,
            channel,
            topology,
            cache,
            notifier,
            relay,
        }
    }

    impl Harness {
        async fn publish_result(&self, id: &str) {
            let result = ProcessingResult {
                id: id.to_string(),
                product_id: "P-100".into(),
                batch_id: "B-7".into(),
                outcome: Outcome::Success,
                confidence: 0.9,
                defect_type: None,
                inspected_at: Utc::now(),
                metadata: Default::default(),
            };
            let envelope = MessageEnvelope::from_payload(id, &result).unwrap();
            let (body, properties) = wire::encode(&envelope).unwrap();
            self.channel
                .publish("", &self.topology.results_queue, body, properties)
                .await
                .unwrap();
        }

        async fn consume(&self) -> DeliveryStream {
            self.channel
                .consume(&self.topology.results_queue, 1)
                .await
                .unwrap()
        }
    }

    async fn next(deliveries: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .expect("delivery in time")
            .expect("stream open")
    }

    async fn wait_for_depth(broker: &InMemoryBroker, queue: &str, depth: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.queue_depth(queue) != depth {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue depth reached");
    }

    #[tokio::test]
    async fn relayed_result_is_sequenced_and_acked() {
        let h = harness().await;
        let mut live = h.notifier.subscribe("c1").await;
        h.publish_result("R1").await;
        let mut deliveries = h.consume().await;

        let outcome = h
            .relay
            .relay(next(&mut deliveries).await, &CancellationToken::new())
            .await;

        assert_eq!(outcome, RelayOutcome::Delivered(1));
        assert_eq!(live.recv().await.unwrap().payload.id, "R1");
        assert_eq!(h.broker.queue_depth(&h.topology.results_queue), 0);
    }

    #[tokio::test]
    async fn undecodable_result_is_dead_lettered() {
        let h = harness().await;
        h.channel
            .publish(
                "",
                &h.topology.results_queue,
                b"not json".to_vec(),
                Default::default(),
            )
            .await
            .unwrap();
        let mut deliveries = h.consume().await;

        let outcome = h
            .relay
            .relay(next(&mut deliveries).await, &CancellationToken::new())
            .await;

        assert_eq!(outcome, RelayOutcome::DeadLettered);
        assert_eq!(h.broker.queue_depth(&h.topology.dead_letter_queue), 1);
        assert_eq!(h.notifier.latest().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivered_result_is_not_sequenced_twice() {
        let h = harness().await;
        h.publish_result("R1").await;
        h.publish_result("R1").await;
        let mut deliveries = h.consume().await;
        let cancel = CancellationToken::new();

        let first = h.relay.relay(next(&mut deliveries).await, &cancel).await;
        let second = h.relay.relay(next(&mut deliveries).await, &cancel).await;

        assert_eq!(first, RelayOutcome::Delivered(1));
        assert_eq!(second, RelayOutcome::Duplicate);
        assert_eq!(h.notifier.latest().await.unwrap(), 1);
        assert_eq!(h.broker.queue_depth(&h.topology.results_queue), 0);
    }

    #[tokio::test]
    async fn failed_notify_requeues_the_result() {
        let h = harness().await;
        h.publish_result("R1").await;
        let mut deliveries = h.consume().await;
        let cancel = CancellationToken::new();

        h.cache.inner.fail_next_writes(1);
        let outcome = h.relay.relay(next(&mut deliveries).await, &cancel).await;
        assert_eq!(outcome, RelayOutcome::Requeued);

        let retried = next(&mut deliveries).await;
        assert!(retried.redelivered);
        assert_eq!(
            h.relay.relay(retried, &cancel).await,
            RelayOutcome::Delivered(1)
        );
    }

    #[tokio::test]
    async fn integrity_fault_requeues_the_result() {
        let h = harness().await;
        h.publish_result("R1").await;
        let mut deliveries = h.consume().await;

        h.cache.reject_sets.store(true, Ordering::SeqCst);
        let outcome = h
            .relay
            .relay(next(&mut deliveries).await, &CancellationToken::new())
            .await;

        assert_eq!(outcome, RelayOutcome::Halted);
        assert_matches!(
            h.notifier.integrity_fault(),
            Some(PipelineError::SequenceIntegrityViolation { sequence: 1, .. })
        );
        assert_eq!(h.broker.queue_depth(&h.topology.dead_letter_queue), 0);
        assert!(next(&mut deliveries).await.redelivered);
    }

    #[tokio::test]
    async fn relay_halts_on_integrity_fault_and_keeps_results_queued() {
        let h = harness().await;
        for id in ["R0", "R1", "R2"] {
            h.publish_result(id).await;
        }
        h.cache.reject_sets.store(true, Ordering::SeqCst);

        let Harness {
            broker,
            topology,
            notifier,
            relay,
            ..
        } = h;
        tokio::time::timeout(Duration::from_secs(5), relay.run(CancellationToken::new()))
            .await
            .expect("relay halts without being cancelled");

        assert!(notifier.integrity_fault().is_some());
        wait_for_depth(&broker, &topology.results_queue, 3).await;
        assert_eq!(broker.queue_depth(&topology.dead_letter_queue), 0);
    }
}
