//! Exponential-backoff reconnection for long-lived consumers.
//!
//! When a consumer's channel drops, [`reconnect_loop`] keeps retrying with
//! increasing delays until a channel is open and the topology declared, or
//! the [`CancellationToken`] is triggered.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{Channel, Connector};
use crate::topology::Topology;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second connection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Connect and declare `topology`, retrying with exponential backoff.
///
/// Returns `Some(channel)` once connected, or `None` if `cancel` fires
/// first. The first attempt is made immediately.
pub async fn reconnect_loop(
    connector: &dyn Connector,
    topology: &Topology,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<Arc<dyn Channel>> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Broker connect cancelled");
                return None;
            }
            result = async {
                let channel = connector.connect().await?;
                topology.declare(channel.as_ref()).await?;
                Ok::<_, crate::error::BrokerError>(channel)
            } => result,
        };

        match result {
            Ok(channel) => {
                tracing::info!(attempt, queue = %topology.request_queue, "Connected to broker");
                return Some(channel);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker connect attempt failed",
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
