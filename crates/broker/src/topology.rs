//! Exchange and queue layout of the inspection pipeline.

use crate::broker::{Channel, ExchangeKind, QueueSpec};
use crate::error::BrokerError;

/// An (exchange, routing key) pair to publish to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Publish straight to a named queue through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

/// Names of every broker object the pipeline relies on.
///
/// ```text
/// exchange (topic) --routing_key--> request_queue --nack--> dead_letter_exchange (direct)
///                                                               |
///                                                               v
///                                                       dead_letter_queue
/// results_queue (default exchange) --nack--> dead_letter_exchange
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub routing_key: String,
    pub request_queue: String,
    pub results_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "quality-events".into(),
            routing_key: "quality.inspection.requested".into(),
            request_queue: "inspection-requests".into(),
            results_queue: "inspection-results".into(),
            dead_letter_exchange: "inspection-dlx".into(),
            dead_letter_queue: "inspection-dlq".into(),
        }
    }
}

impl Topology {
    pub fn requests_route(&self) -> Route {
        Route::new(&self.exchange, &self.routing_key)
    }

    pub fn results_route(&self) -> Route {
        Route::queue(&self.results_queue)
    }

    pub fn dead_letter_route(&self) -> Route {
        Route::new(&self.dead_letter_exchange, &self.dead_letter_queue)
    }

    /// Same-queue redelivery, bypassing the topic exchange.
    pub fn redelivery_route(&self) -> Route {
        Route::queue(&self.request_queue)
    }

    /// Declare every exchange, queue and binding. Safe to call on every
    /// new channel.
    pub async fn declare(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        channel
            .declare_exchange(&self.exchange, ExchangeKind::Topic)
            .await?;
        channel
            .declare_exchange(&self.dead_letter_exchange, ExchangeKind::Direct)
            .await?;

        channel
            .declare_queue(&QueueSpec::new(&self.dead_letter_queue))
            .await?;
        channel
            .bind_queue(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                &self.dead_letter_queue,
            )
            .await?;

        channel
            .declare_queue(
                &QueueSpec::new(&self.request_queue)
                    .with_dead_letter(&self.dead_letter_exchange, &self.dead_letter_queue),
            )
            .await?;
        channel
            .bind_queue(&self.request_queue, &self.exchange, &self.routing_key)
            .await?;

        channel
            .declare_queue(
                &QueueSpec::new(&self.results_queue)
                    .with_dead_letter(&self.dead_letter_exchange, &self.dead_letter_queue),
            )
            .await?;

        tracing::debug!(
            exchange = %self.exchange,
            queue = %self.request_queue,
            dlq = %self.dead_letter_queue,
            "Broker topology declared",
        );
        Ok(())
    }
}
