//! Sequenced fan-out of processing results to live subscribers.
//!
//! Every result handed to [`FanOutNotifier::notify`] is assigned the next
//! sequence number, persisted to the [`EventStore`] and then pushed to
//! every subscriber. A subscriber that missed events (disconnect, slow
//! start) recovers them with [`FanOutNotifier::catch_up`].
//!
//! Concurrent notifications are not serialized: the sequence number is
//! the ordering signal, and a subscriber may receive events out of order.
//! Each subscriber has a bounded queue; one that falls behind is dropped
//! and recovers through catch-up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use linewatch_core::clock::Clock;
use linewatch_core::error::PipelineError;
use linewatch_core::inspection::ProcessingResult;
use linewatch_core::sink::ResultSink;
use linewatch_core::types::SequenceNumber;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::bus::NotificationBus;
use crate::event::NotificationEvent;
use crate::sequencer::Sequencer;
use crate::store::EventStore;

/// Default cap on events returned by one catch-up call.
pub const DEFAULT_CATCH_UP_MAX: usize = 100;

/// Default number of undelivered events a subscriber may have queued.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Events returned by a catch-up call plus the newest known sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchUp {
    pub events: Vec<NotificationEvent>,
    pub latest: SequenceNumber,
}

struct Subscriber {
    last_acked: SequenceNumber,
    sender: mpsc::Sender<NotificationEvent>,
}

pub struct FanOutNotifier {
    sequencer: Sequencer,
    store: EventStore,
    clock: Arc<dyn Clock>,
    bus: Arc<NotificationBus>,
    catch_up_max: usize,
    subscriber_buffer: usize,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    /// Latched on the first integrity violation.
    fault: Mutex<Option<PipelineError>>,
}

impl FanOutNotifier {
    pub fn new(
        sequencer: Sequencer,
        store: EventStore,
        clock: Arc<dyn Clock>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            sequencer,
            store,
            clock,
            bus,
            catch_up_max: DEFAULT_CATCH_UP_MAX,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            subscribers: RwLock::new(HashMap::new()),
            fault: Mutex::new(None),
        }
    }

    pub fn with_catch_up_max(mut self, max: usize) -> Self {
        self.catch_up_max = max;
        self
    }

    /// Queue capacity of each subscriber. Clamped to at least one.
    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn retention(&self) -> Duration {
        self.store.retention()
    }

    /// The integrity violation that stopped this notifier, if any.
    pub fn integrity_fault(&self) -> Option<PipelineError> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -- subscribers --------------------------------------------------------

    /// Register `connection_id` for live notifications. Re-subscribing
    /// replaces the previous registration.
    ///
    /// The receiver closes when the connection unsubscribes or falls more
    /// than the subscriber buffer behind.
    pub async fn subscribe(&self, connection_id: &str) -> mpsc::Receiver<NotificationEvent> {
        let (sender, receiver) = mpsc::channel(self.subscriber_buffer);
        self.subscribers.write().await.insert(
            connection_id.to_string(),
            Subscriber {
                last_acked: 0,
                sender,
            },
        );
        tracing::info!(connection_id, "Subscriber registered");
        receiver
    }

    pub async fn unsubscribe(&self, connection_id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(connection_id).is_some();
        if removed {
            tracing::info!(connection_id, "Subscriber removed");
        }
        removed
    }

    pub async fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.read().await.contains_key(connection_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Record that `connection_id` has seen everything up to `sequence`.
    /// The acknowledged position never moves backwards. Returns the new
    /// position, or `None` for an unknown connection.
    pub async fn ack(&self, connection_id: &str, sequence: SequenceNumber) -> Option<SequenceNumber> {
        let mut subscribers = self.subscribers.write().await;
        let sub = subscribers.get_mut(connection_id)?;
        sub.last_acked = sub.last_acked.max(sequence);
        Some(sub.last_acked)
    }

    pub async fn last_acked(&self, connection_id: &str) -> Option<SequenceNumber> {
        self.subscribers
            .read()
            .await
            .get(connection_id)
            .map(|s| s.last_acked)
    }

    // -- sequencing ---------------------------------------------------------

    /// Sequence, store and broadcast `result`.
    ///
    /// Once an event cannot be stored the notifier refuses all further
    /// work with [`PipelineError::SequenceIntegrityViolation`].
    pub async fn notify(&self, result: ProcessingResult) -> Result<NotificationEvent, PipelineError> {
        if let Some(fault) = self.integrity_fault() {
            return Err(fault);
        }

        let sequence = self.sequencer.next_sequence().await?;
        let event = NotificationEvent::inspection_update(
            sequence,
            result,
            self.clock.now(),
            self.store.retention(),
        );

        if let Err(e) = self.store.store(&event).await {
            if matches!(e, PipelineError::SequenceIntegrityViolation { .. }) {
                *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
            }
            return Err(e);
        }

        let delivered = self.broadcast(&event).await;
        self.bus.publish(event.clone());

        tracing::info!(
            sequence,
            event_id = %event.event_id,
            outcome = %event.payload.outcome,
            subscribers = delivered,
            "Notification broadcast",
        );
        Ok(event)
    }

    /// Push `event` to every live subscriber without waiting. Subscribers
    /// whose receiver is gone or whose queue is full are removed. Returns
    /// how many received it.
    pub async fn broadcast(&self, event: &NotificationEvent) -> usize {
        let targets: Vec<(String, mpsc::Sender<NotificationEvent>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, sub)| (id.clone(), sub.sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %id,
                        sequence = event.sequence_number,
                        "Subscriber fell behind, dropping it",
                    );
                    gone.push((id, sender));
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection_id = %id, "Dropped closed subscriber");
                    gone.push((id, sender));
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for (id, sender) in &gone {
                // Only remove the registration this broadcast saw; a
                // re-subscribe in between keeps its new channel.
                if subscribers
                    .get(id)
                    .is_some_and(|sub| sub.sender.same_channel(sender))
                {
                    subscribers.remove(id);
                }
            }
        }

        delivered
    }

    /// Events after `last_seen`, ascending, bounded by `max_count` and the
    /// configured catch-up cap. A subscribed connection's acknowledged
    /// position advances to the last returned event.
    pub async fn catch_up(
        &self,
        connection_id: &str,
        last_seen: SequenceNumber,
        max_count: usize,
    ) -> Result<CatchUp, PipelineError> {
        let limit = max_count.min(self.catch_up_max);
        let events = self.store.get_since(last_seen, limit).await?;
        let latest = self.store.latest().await?;

        if let Some(last) = events.last() {
            self.ack(connection_id, last.sequence_number).await;
        }

        tracing::debug!(
            connection_id,
            last_seen,
            returned = events.len(),
            latest,
            "Catch-up served",
        );
        Ok(CatchUp { events, latest })
    }

    pub async fn get_since(
        &self,
        last_seen: SequenceNumber,
        max_count: usize,
    ) -> Result<Vec<NotificationEvent>, PipelineError> {
        self.store
            .get_since(last_seen, max_count.min(self.catch_up_max))
            .await
    }

    pub async fn latest(&self) -> Result<SequenceNumber, PipelineError> {
        self.store.latest().await
    }
}

#[async_trait]
impl ResultSink for FanOutNotifier {
    async fn deliver(&self, result: &ProcessingResult) -> Result<(), PipelineError> {
        self.notify(result.clone()).await.map(|_| ())
    }
}
