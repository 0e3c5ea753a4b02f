//! TTL-bounded event history keyed by sequence number.
//!
//! Layout in the backing cache:
//!
//! | key               | value                          | expiry    |
//! |-------------------|--------------------------------|-----------|
//! | `event:{seq}`     | JSON [`NotificationEvent`]     | retention |
//! | `sequence:latest` | highest stored sequence number | none      |

use std::sync::Arc;
use std::time::Duration;

use linewatch_core::error::PipelineError;
use linewatch_core::types::SequenceNumber;

use crate::cache::{CacheError, EventCache};
use crate::event::NotificationEvent;

pub const LATEST_SEQUENCE_KEY: &str = "sequence:latest";

/// Default time an event stays available for catch-up.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts made to persist one event before the gap is declared fatal.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);

pub fn event_key(sequence: SequenceNumber) -> String {
    format!("event:{sequence}")
}

pub struct EventStore {
    cache: Arc<dyn EventCache>,
    retention: Duration,
}

impl EventStore {
    pub fn new(cache: Arc<dyn EventCache>, retention: Duration) -> Self {
        Self { cache, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Persist `event` under its sequence number and advance the latest
    /// marker.
    ///
    /// The sequence number is already allocated, so a write that keeps
    /// failing would leave a permanent hole in the history. That is
    /// reported as [`PipelineError::SequenceIntegrityViolation`].
    pub async fn store(&self, event: &NotificationEvent) -> Result<(), PipelineError> {
        let sequence = event.sequence_number;
        let body = serde_json::to_string(event).map_err(|e| {
            PipelineError::SequenceIntegrityViolation {
                sequence,
                reason: format!("event not serializable: {e}"),
            }
        })?;

        let mut last_error = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.write(sequence, &body).await {
                Ok(()) => {
                    tracing::debug!(sequence, event_id = %event.event_id, "Event stored");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(sequence, attempt, error = %e, "Event write failed");
                    last_error = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }

        let reason = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        tracing::error!(sequence, %reason, "Sequence integrity violated, event could not be stored");
        Err(PipelineError::SequenceIntegrityViolation { sequence, reason })
    }

    async fn write(&self, sequence: SequenceNumber, body: &str) -> Result<(), CacheError> {
        self.cache
            .set(&event_key(sequence), body.to_string(), Some(self.retention))
            .await?;
        self.cache.set_max(LATEST_SEQUENCE_KEY, sequence).await?;
        Ok(())
    }

    /// Events with sequence greater than `last_seen`, ascending, at most
    /// `max_count`. Events whose retention lapsed are skipped.
    pub async fn get_since(
        &self,
        last_seen: SequenceNumber,
        max_count: usize,
    ) -> Result<Vec<NotificationEvent>, PipelineError> {
        let mut events = Vec::new();
        let Some(first) = last_seen.max(0).checked_add(1) else {
            return Ok(events);
        };
        let latest = self.latest().await?;

        for sequence in first..=latest {
            if events.len() >= max_count {
                break;
            }
            if let Some(raw) = self.cache.get(&event_key(sequence)).await? {
                match serde_json::from_str::<NotificationEvent>(&raw) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        tracing::warn!(sequence, error = %e, "Skipping unreadable stored event");
                    }
                }
            }
        }

        Ok(events)
    }

    /// Highest stored sequence number, `0` when nothing was stored yet.
    pub async fn latest(&self) -> Result<SequenceNumber, PipelineError> {
        match self.cache.get(LATEST_SEQUENCE_KEY).await? {
            Some(raw) => raw.parse().map_err(|_| {
                PipelineError::from(CacheError::NotAnInteger {
                    key: LATEST_SEQUENCE_KEY.to_string(),
                })
            }),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use linewatch_core::clock::{Clock, ManualClock};
    use linewatch_core::inspection::{Outcome, ProcessingResult};

    use super::*;
    use crate::cache::InMemoryEventCache;

    fn result(id: &str) -> ProcessingResult {
        ProcessingResult {
            id: id.to_string(),
            product_id: "P".into(),
            batch_id: "B".into(),
            outcome: Outcome::Success,
            confidence: 0.9,
            defect_type: None,
            inspected_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    fn setup(retention: Duration) -> (EventStore, Arc<InMemoryEventCache>, ManualClock) {
        let clock = ManualClock::new();
        let cache = Arc::new(InMemoryEventCache::new(Arc::new(clock.clone())));
        (EventStore::new(cache.clone(), retention), cache, clock)
    }

    async fn store_range(store: &EventStore, clock: &ManualClock, range: std::ops::RangeInclusive<i64>) {
        for seq in range {
            let event = NotificationEvent::inspection_update(
                seq,
                result(&format!("E{seq}")),
                clock.now(),
                store.retention(),
            );
            store.store(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_store_has_latest_zero() {
        let (store, _, _) = setup(DEFAULT_RETENTION);
        assert_eq!(store.latest().await.unwrap(), 0);
        assert!(store.get_since(0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_since_is_ascending_bounded_and_exclusive() {
        let (store, _, clock) = setup(DEFAULT_RETENTION);
        store_range(&store, &clock, 1..=10).await;

        let events = store.get_since(3, 4).await.unwrap();
        let seqs: Vec<_> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);

        assert!(store.get_since(10, 100).await.unwrap().is_empty());
        assert!(store.get_since(0, 0).await.unwrap().is_empty());
        assert_eq!(store.latest().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn get_since_past_the_largest_sequence_is_empty() {
        let (store, _, clock) = setup(DEFAULT_RETENTION);
        store_range(&store, &clock, 1..=3).await;

        assert!(store.get_since(i64::MAX, 10).await.unwrap().is_empty());
        assert!(store.get_since(i64::MAX - 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_events_are_skipped() {
        let (store, _, clock) = setup(Duration::from_secs(60));
        store_range(&store, &clock, 1..=2).await;
        clock.advance(Duration::from_secs(30));
        store_range(&store, &clock, 3..=4).await;
        clock.advance(Duration::from_secs(30));

        let seqs: Vec<_> = store
            .get_since(0, 100)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(store.latest().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn transient_write_failure_is_retried() {
        let (store, cache, clock) = setup(DEFAULT_RETENTION);
        cache.fail_next_writes(2);
        store_range(&store, &clock, 1..=1).await;
        assert_eq!(store.get_since(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_write_failure_is_integrity_violation() {
        let (store, cache, clock) = setup(DEFAULT_RETENTION);
        cache.fail_next_writes(u32::MAX);
        let event = NotificationEvent::inspection_update(7, result("E7"), clock.now(), DEFAULT_RETENTION);

        assert_matches!(
            store.store(&event).await,
            Err(PipelineError::SequenceIntegrityViolation { sequence: 7, .. })
        );
    }
}
