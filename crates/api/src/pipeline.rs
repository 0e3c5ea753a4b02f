//! Wiring of the pipeline components and their background tasks.
//!
//! ```text
//! POST /events -> ResilientPublisher -> request queue -> QueueWorker
//!     -> IdempotentConsumer -> QueueResultSink -> results queue
//!     -> ResultRelay -> FanOutNotifier -> WebSocket subscribers
//!                                      -> NotificationBus -> AlertObserver
//! ```

use std::sync::Arc;
use std::time::Duration;

use linewatch_broker::reconnect::ReconnectConfig;
use linewatch_broker::{
    Connector, IdempotencyStore, IdempotentConsumer, QueueResultSink, QueueWorker,
    ResilientPublisher,
};
use linewatch_core::clock::Clock;
use linewatch_core::strategy::{InspectionStrategy, SimulatedStrategy};
use linewatch_events::{
    AlertObserver, EventStore, FanOutNotifier, InMemoryEventCache, NotificationBus, Sequencer,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::background::event_retention::{self, PURGE_INTERVAL};
use crate::background::result_relay::ResultRelay;
use crate::config::PipelineConfig;

/// The simulated strategy, seeded when the configuration asks for it.
pub fn strategy_for(config: &PipelineConfig) -> Arc<dyn InspectionStrategy> {
    match config.simulation_seed {
        Some(seed) => {
            tracing::info!(seed, "Using seeded simulated inspection strategy");
            Arc::new(SimulatedStrategy::seeded(seed))
        }
        None => Arc::new(SimulatedStrategy::from_os_rng()),
    }
}

/// Every long-lived pipeline component, built once at startup.
pub struct Pipeline {
    pub publisher: Arc<ResilientPublisher>,
    pub notifier: Arc<FanOutNotifier>,
    pub cache: Arc<InMemoryEventCache>,
    pub consumer: Arc<IdempotentConsumer>,
    worker: Arc<QueueWorker>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Build the components. Nothing runs until [`Pipeline::start`].
    ///
    /// `cancel` stops the background tasks and aborts result publishes
    /// still backing off.
    pub fn build(
        config: &PipelineConfig,
        connector: Arc<dyn Connector>,
        strategy: Arc<dyn InspectionStrategy>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let topology = config.topology();

        let publisher = Arc::new(ResilientPublisher::new(
            Arc::clone(&connector),
            topology.clone(),
            config.retry_policy(),
            config.circuit_config(),
            Arc::clone(&clock),
        ));

        let cache = Arc::new(InMemoryEventCache::new(Arc::clone(&clock)));
        let notifier = Arc::new(
            FanOutNotifier::new(
                Sequencer::new(cache.clone()),
                EventStore::new(cache.clone(), config.event_retention),
                Arc::clone(&clock),
                Arc::new(NotificationBus::default()),
            )
            .with_catch_up_max(config.catch_up_max_count),
        );

        let consumer = Arc::new(IdempotentConsumer::new(
            strategy,
            Arc::new(QueueResultSink::new(Arc::clone(&publisher), cancel.clone())),
            IdempotencyStore::new(config.idempotency_window, Arc::clone(&clock)),
        ));

        let worker = Arc::new(QueueWorker::new(
            Arc::clone(&connector),
            topology,
            Arc::clone(&consumer),
            config.worker_config(),
        ));

        Self {
            publisher,
            notifier,
            cache,
            consumer,
            worker,
            connector,
            clock,
            config: config.clone(),
            cancel,
        }
    }

    /// Spawn the consumer worker, the result relay, the retention job and
    /// the alert observer.
    pub fn start(&self) -> PipelineTasks {
        let worker = tokio::spawn(Arc::clone(&self.worker).run(self.cancel.clone()));

        let relay = ResultRelay::new(
            Arc::clone(&self.connector),
            self.config.topology(),
            Arc::clone(&self.notifier),
            IdempotencyStore::new(self.config.idempotency_window, Arc::clone(&self.clock)),
            self.config.prefetch,
            ReconnectConfig::default(),
        );
        let relay = tokio::spawn(relay.run(self.cancel.clone()));

        let retention = tokio::spawn(event_retention::run(
            Arc::clone(&self.cache),
            PURGE_INTERVAL,
            self.cancel.clone(),
        ));

        let alerts = tokio::spawn(AlertObserver::run(self.notifier.bus().subscribe()));

        tracing::info!("Pipeline started (worker, result relay, retention, alerts)");

        PipelineTasks {
            cancel: self.cancel.clone(),
            stoppable: vec![
                ("queue worker", worker),
                ("result relay", relay),
                ("event retention", retention),
            ],
            alerts,
        }
    }
}

/// Handles of the running pipeline tasks.
pub struct PipelineTasks {
    cancel: CancellationToken,
    stoppable: Vec<(&'static str, JoinHandle<()>)>,
    /// Runs until the bus closes; aborted on stop.
    alerts: JoinHandle<()>,
}

impl PipelineTasks {
    /// Cancel every task and wait up to `timeout` for each to finish.
    ///
    /// In-flight deliveries are requeued by the worker as it drains.
    pub async fn stop(self, timeout: Duration) {
        self.cancel.cancel();

        for (name, handle) in self.stoppable {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "Pipeline task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Pipeline task panicked"),
                Err(_) => tracing::warn!(task = name, "Pipeline task did not stop in time"),
            }
        }

        self.alerts.abort();
    }
}
