//! Sequence number allocation.

use std::sync::Arc;

use linewatch_core::error::PipelineError;
use linewatch_core::types::SequenceNumber;

use crate::cache::EventCache;

/// Cache key of the allocation counter. Never expires.
pub const SEQUENCE_COUNTER_KEY: &str = "sequence:counter";

/// Hands out strictly increasing sequence numbers starting at 1.
///
/// Allocation is a single atomic increment in the backing cache, so K
/// concurrent callers receive exactly `base+1 ..= base+K`.
pub struct Sequencer {
    cache: Arc<dyn EventCache>,
}

impl Sequencer {
    pub fn new(cache: Arc<dyn EventCache>) -> Self {
        Self { cache }
    }

    pub async fn next_sequence(&self) -> Result<SequenceNumber, PipelineError> {
        self.cache
            .incr(SEQUENCE_COUNTER_KEY)
            .await
            .map_err(|e| PipelineError::Transient(format!("sequence allocation failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use linewatch_core::clock::ManualClock;

    use super::*;
    use crate::cache::InMemoryEventCache;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_is_gap_free() {
        let cache: Arc<dyn EventCache> =
            Arc::new(InMemoryEventCache::new(Arc::new(ManualClock::new())));
        let sequencer = Arc::new(Sequencer::new(Arc::clone(&cache)));

        let base = sequencer.next_sequence().await.unwrap();
        let k = 64;

        let tasks: Vec<_> = (0..k)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                tokio::spawn(async move { sequencer.next_sequence().await.unwrap() })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()), "duplicate sequence");
        }

        let expected: BTreeSet<_> = (base + 1..=base + k).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn failed_increment_is_transient() {
        let cache = Arc::new(InMemoryEventCache::new(Arc::new(ManualClock::new())));
        cache.fail_next_writes(1);
        let sequencer = Sequencer::new(cache);

        assert!(matches!(
            sequencer.next_sequence().await,
            Err(PipelineError::Transient(_))
        ));
        assert_eq!(sequencer.next_sequence().await.unwrap(), 1);
    }
}
