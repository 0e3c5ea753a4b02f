//! Broker plumbing for the linewatch pipeline.
//!
//! - [`broker`]: the minimal capability interface over a durable,
//!   topic-routed queue ([`Connector`], [`Channel`], [`Delivery`]).
//! - [`memory`]: an in-process implementation of that interface.
//! - [`publisher`]: [`ResilientPublisher`]: lazy connection, retry with
//!   exponential backoff, circuit breaking.
//! - [`consumer`]: [`IdempotentConsumer`]: windowed deduplication around a
//!   pluggable inspection strategy.
//! - [`worker`]: [`QueueWorker`]: pulls deliveries and makes the
//!   ack / retry / dead-letter decision.

pub mod broker;
pub mod circuit;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod publisher;
pub mod reconnect;
pub mod retry;
pub mod topology;
pub mod wire;
pub mod worker;

pub use broker::{Channel, Connector, Delivery, DeliveryStream, MessageProperties};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use consumer::{HandleOutcome, IdempotentConsumer};
pub use error::BrokerError;
pub use idempotency::{Admission, IdempotencyStore};
pub use memory::InMemoryBroker;
pub use publisher::{QueueResultSink, ResilientPublisher};
pub use retry::RetryPolicy;
pub use topology::{Route, Topology};
pub use worker::{QueueWorker, Settlement, WorkerConfig};
