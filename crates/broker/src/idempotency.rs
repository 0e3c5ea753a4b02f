//! Windowed record of envelope ids already accepted for processing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use linewatch_core::clock::Clock;
use linewatch_core::types::{to_chrono, Timestamp};

/// Default deduplication window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Result of [`IdempotencyStore::check_and_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting within the window; the id is now recorded.
    Accepted,
    /// Already recorded at `first_seen_at`.
    Duplicate { first_seen_at: Timestamp },
}

/// Maps envelope id to the time it was first accepted.
///
/// Check-and-insert is atomic: of N concurrent callers with the same id,
/// exactly one is [`Admission::Accepted`]. Records older than the window
/// are evicted lazily on every check.
#[derive(Debug)]
pub struct IdempotencyStore {
    window: Duration,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, Timestamp>>,
}

impl IdempotencyStore {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Timestamp>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check_and_insert(&self, id: &str) -> Admission {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.window);
        let mut records = self.lock();

        records.retain(|_, first_seen| *first_seen > cutoff);

        match records.get(id) {
            Some(&first_seen_at) => Admission::Duplicate { first_seen_at },
            None => {
                records.insert(id.to_string(), now);
                Admission::Accepted
            }
        }
    }

    /// Forget `id` so a redelivery is processed again. Returns whether a
    /// record existed.
    pub fn release(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
