//! Periodic purge of expired notification events.
//!
//! Reads already skip expired entries; this task reclaims their memory.
//! The sequence counter and latest marker carry no TTL and survive.

use std::sync::Arc;
use std::time::Duration;

use linewatch_events::InMemoryEventCache;
use tokio_util::sync::CancellationToken;

/// How often the purge runs.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Run the retention loop until `cancel` is triggered.
pub async fn run(cache: Arc<InMemoryEventCache>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Event retention job started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Event retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    tracing::info!(purged, "Event retention: purged expired entries");
                } else {
                    tracing::debug!("Event retention: nothing to purge");
                }
            }
        }
    }
}
