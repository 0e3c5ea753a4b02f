//! Key-value cache the sequencer and event store persist into.
//!
//! The operations mirror what a networked cache such as Redis offers:
//! string get/set with optional expiry, atomic increment, and an atomic
//! "raise to at least" used to track the newest stored sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linewatch_core::clock::Clock;
use linewatch_core::error::PipelineError;
use linewatch_core::types::{to_chrono, Timestamp};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Value at '{key}' is not an integer")]
    NotAnInteger { key: String },
}

impl From<CacheError> for PipelineError {
    fn from(err: CacheError) -> Self {
        PipelineError::Transient(err.to_string())
    }
}

#[async_trait]
pub trait EventCache: Send + Sync {
    /// Value at `key`, or `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomically add one to the integer at `key` (missing reads as `0`)
    /// and return the new value. Counters never expire.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Atomically raise the integer at `key` to at least `value` and
    /// return what is stored afterwards.
    async fn set_max(&self, key: &str, value: i64) -> Result<i64, CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local [`EventCache`] with lazy expiry.
pub struct InMemoryEventCache {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry>>,
    failing_writes: AtomicU32,
}

impl InMemoryEventCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` write operations fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), CacheError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(CacheError::Unavailable("write rejected".into()))
        } else {
            Ok(())
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Live entries.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn parse_int(key: &str, entry: Option<&Entry>) -> Result<i64, CacheError> {
    match entry {
        None => Ok(0),
        Some(e) => e.value.parse().map_err(|_| CacheError::NotAnInteger {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl EventCache for InMemoryEventCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_write()?;
        let expires_at = ttl.map(|ttl| self.clock.now() + to_chrono(ttl));
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.check_write()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let current = parse_int(key, entries.get(key).filter(|e| e.is_live(now)))?;
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn set_max(&self, key: &str, value: i64) -> Result<i64, CacheError> {
        self.check_write()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let current = parse_int(key, entries.get(key).filter(|e| e.is_live(now)))?;
        let stored = current.max(value);
        entries.insert(
            key.to_string(),
            Entry {
                value: stored.to_string(),
                expires_at: None,
            },
        );
        Ok(stored)
    }
}
