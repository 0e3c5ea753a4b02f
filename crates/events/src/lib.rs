//! Sequenced notification infrastructure.
//!
//! - [`Sequencer`]: gap-free, monotonically increasing sequence numbers.
//! - [`EventStore`]: TTL-bounded history of [`NotificationEvent`]s keyed
//!   by sequence, with range reads for catch-up.
//! - [`FanOutNotifier`]: assigns a sequence to every processing result,
//!   stores it and broadcasts it to live subscribers.
//! - [`NotificationBus`]: in-process broadcast of stored events for
//!   observers such as [`AlertObserver`].

pub mod alerts;
pub mod bus;
pub mod cache;
pub mod event;
pub mod notifier;
pub mod sequencer;
pub mod store;

pub use alerts::AlertObserver;
pub use bus::NotificationBus;
pub use cache::{CacheError, EventCache, InMemoryEventCache};
pub use event::NotificationEvent;
pub use notifier::{CatchUp, FanOutNotifier};
pub use sequencer::Sequencer;
pub use store::EventStore;
