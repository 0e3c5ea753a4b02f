//! In-process broker.
//!
//! Implements [`Connector`] and [`Channel`] with the semantics the pipeline
//! relies on from a real broker: topic and direct exchanges, the default
//! exchange, per-consumer prefetch, explicit acknowledgement, requeue of
//! deliveries dropped unsettled, and dead-lettering of rejected messages.
//!
//! It also carries fault-injection knobs (`set_online`,
//! `fail_next_publishes`, `drop_connections`, ...) and I/O counters used by
//! tests to observe retry and circuit-breaker behaviour.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};

use crate::broker::{
    Acker, Channel, Connector, DeadLetterTarget, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, QueueSpec,
};
use crate::error::BrokerError;

/// A message at rest in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

struct QueueCore {
    dead_letter: Option<DeadLetterTarget>,
    messages: Mutex<VecDeque<StoredMessage>>,
    ready: Notify,
}

impl QueueCore {
    fn new(spec: &QueueSpec) -> Self {
        Self {
            dead_letter: spec.dead_letter.clone(),
            messages: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<StoredMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_back(&self, message: StoredMessage) {
        self.lock().push_back(message);
        self.ready.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.lock().push_front(message);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        self.lock().pop_front()
    }
}

struct Exchange {
    kind: ExchangeKind,
    /// `(binding key, queue name)`
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<QueueCore>>,
}

struct Shared {
    registry: Mutex<Registry>,
    online: AtomicBool,
    /// Bumped whenever existing channels must be considered closed.
    generation: watch::Sender<u64>,
    failing_publishes: AtomicU32,
    failing_connects: AtomicU32,
    publish_attempts: AtomicU64,
    connect_attempts: AtomicU64,
    next_tag: AtomicU64,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueCore>, BrokerError> {
        self.registry()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound {
                kind: "queue",
                name: name.to_string(),
            })
    }

    /// Deliver `message` to every queue `exchange` routes `routing_key` to.
    /// Unroutable messages are dropped.
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, BrokerError> {
        let targets: Vec<Arc<QueueCore>> = {
            let registry = self.registry();
            if exchange.is_empty() {
                registry.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let ex = registry
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| BrokerError::NotFound {
                        kind: "exchange",
                        name: exchange.to_string(),
                    })?;
                let names: BTreeSet<&String> = ex
                    .bindings
                    .iter()
                    .filter(|(key, _)| match ex.kind {
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                    })
                    .map(|(_, queue)| queue)
                    .collect();
                names
                    .into_iter()
                    .filter_map(|name| registry.queues.get(name).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "Unroutable message dropped");
        }
        for queue in &targets {
            queue.push_back(message.clone());
        }
        Ok(targets.len())
    }
}

/// Consume one unit of an injected fault counter.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// AMQP-style topic matching: `*` matches exactly one word, `#` zero or
/// more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                online: AtomicBool::new(true),
                generation,
                failing_publishes: AtomicU32::new(0),
                failing_connects: AtomicU32::new(0),
                publish_attempts: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Take the broker down or bring it back. Going offline closes every
    /// open channel; coming back requires reconnecting.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
        if !online {
            self.drop_connections();
        }
    }

    /// Close every open channel. Consumers see their delivery stream end.
    pub fn drop_connections(&self) {
        self.shared.generation.send_modify(|g| *g += 1);
    }

    /// Make the next `n` publish calls fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Publish calls that reached the broker, successful or not.
    pub fn publish_attempts(&self) -> u64 {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Messages waiting in `queue` (not counting unsettled deliveries).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .queue(queue)
            .map(|q| q.lock().len())
            .unwrap_or(0)
    }

    /// Remove and return every ready message in `queue`.
    pub fn take_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .queue(queue)
            .map(|q| q.lock().drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.shared.online.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker offline".into()));
        }
        if take_fault(&self.shared.failing_connects) {
            return Err(BrokerError::Connection("connection refused".into()));
        }

        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            generation: self.shared.current_generation(),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
            && self.shared.current_generation() == self.generation
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared
            .registry()
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared
            .registry()
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| Arc::new(QueueCore::new(spec)));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut registry = self.shared.registry();
        if !registry.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let ex = registry
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.shared.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if take_fault(&self.shared.failing_publishes) {
            return Err(BrokerError::Publish("broker did not confirm".into()));
        }

        self.shared.route(
            exchange,
            routing_key,
            StoredMessage {
                body,
                properties,
                redelivered: false,
            },
        )?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let core = self.shared.queue(queue)?;
        Ok(spawn_pump(
            Arc::clone(&self.shared),
            core,
            prefetch,
            self.generation,
        ))
    }
}

/// Move messages from `queue` into a bounded delivery stream, holding one
/// semaphore permit per unsettled delivery.
fn spawn_pump(
    shared: Arc<Shared>,
    queue: Arc<QueueCore>,
    prefetch: u16,
    generation: u64,
) -> DeliveryStream {
    let capacity = usize::from(prefetch.max(1));
    let (tx, rx) = mpsc::channel(capacity);
    let permits = Arc::new(Semaphore::new(capacity));
    let mut closed = shared.generation.subscribe();

    tokio::spawn(async move {
        loop {
            let permit = tokio::select! {
                _ = tx.closed() => break,
                _ = closed.changed() => {
                    if *closed.borrow() != generation {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let message = loop {
                if *closed.borrow_and_update() != generation {
                    return;
                }
                if let Some(message) = queue.pop() {
                    break message;
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = closed.changed() => {}
                    _ = queue.ready.notified() => {}
                }
            };

            let tag = shared.next_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery::new(
                tag,
                message.body.clone(),
                message.properties.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    shared: Arc::clone(&shared),
                    queue: Arc::clone(&queue),
                    message: Mutex::new(Some(message)),
                    permit: Mutex::new(Some(permit)),
                }),
            );

            // A failed send drops the delivery, which requeues it.
            if tx.send(delivery).await.is_err() {
                break;
            }
        }
    });

    rx
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: Arc<QueueCore>,
    message: Mutex<Option<StoredMessage>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self) -> Option<StoredMessage> {
        let message = self
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        message
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let Some(mut message) = self.settle() else {
            return Ok(());
        };

        if requeue {
            message.redelivered = true;
            self.queue.push_front(message);
            return Ok(());
        }

        match &self.queue.dead_letter {
            Some(target) => {
                self.shared
                    .route(&target.exchange, &target.routing_key, message)?;
            }
            None => tracing::debug!("Rejected message discarded (no dead-letter target)"),
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let unsettled = self
            .message
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut message) = unsettled {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}
