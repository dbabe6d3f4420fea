//! Broker state: exchanges, queues and bindings.

use crate::channel::{ChannelState, ConnectionState};

use amqp_kit::{ExchangeKind, Publishing, TransportError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message sitting in a queue.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) publishing: Publishing,
    pub(crate) redelivered: bool,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages routed to the queue.
    pub published: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries rejected or nacked without requeue.
    pub rejected: u64,
    /// Deliveries returned to the queue, including those of closed channels.
    pub requeued: u64,
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Active consumers.
    pub consumers: u32,
}

impl QueueStats {
    /// Deliveries that reached a final settlement.
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.acked + self.rejected
    }
}

/// A durable queue. Competing consumers pull from the same receiver.
#[derive(Debug)]
pub(crate) struct Queue {
    name: String,
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
    counters: Counters,
    consumers: AtomicU32,
}

impl Queue {
    fn new(name: &str) -> Self {
        let (tx, rx) = flume::unbounded();

        Self {
            name: name.to_string(),
            tx,
            rx,
            counters: Counters::default(),
            consumers: AtomicU32::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) const fn receiver(&self) -> &flume::Receiver<Message> {
        &self.rx
    }

    pub(crate) fn consumer_count(&self) -> u32 {
        self.consumers.load(Ordering::Relaxed)
    }

    fn enqueue(&self, message: Message) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        // The queue holds its own receiver, so the send cannot fail.
        let _ = self.tx.send(message);
    }

    pub(crate) fn requeue(&self, mut message: Message) {
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        message.redelivered = true;
        let _ = self.tx.send(message);
    }

    pub(crate) fn record_ack(&self) {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reject(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.counters.published.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            ready: self.rx.len(),
            consumers: self.consumer_count(),
        }
    }
}

/// A consumer registered on a queue for as long as it lives.
pub(crate) struct Consumer {
    queue: Arc<Queue>,
}

impl Consumer {
    pub(crate) fn new(queue: Arc<Queue>) -> Self {
        queue.consumers.fetch_add(1, Ordering::Relaxed);
        Self { queue }
    }

    pub(crate) const fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.consumers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

/// Shared state behind a [`MemoryBroker`].
#[derive(Debug)]
pub(crate) struct BrokerState {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, Arc<Queue>>,
    bindings: RwLock<Vec<Binding>>,
    pub(crate) connections: DashMap<Uuid, Arc<ConnectionState>>,
    available: AtomicBool,
}

impl BrokerState {
    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        if name.is_empty() {
            return Ok(());
        }

        let existing = *self.exchanges.entry(name.to_string()).or_insert(kind);
        if existing != kind {
            return Err(TransportError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{name}' already declared as {existing:?}"
            )));
        }

        Ok(())
    }

    pub(crate) fn declare_queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(
            &self
                .queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new(name))),
        )
    }

    pub(crate) fn queue(&self, name: &str) -> Result<Arc<Queue>, TransportError> {
        self.queues
            .get(name)
            .map(|queue| Arc::clone(&queue))
            .ok_or_else(|| TransportError::Channel(format!("NOT_FOUND - no queue '{name}'")))
    }

    pub(crate) fn bind(&self, queue: &str, key: &str, exchange: &str) -> Result<(), TransportError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        self.queue(queue)?;

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: key.to_string(),
        };

        let mut bindings = self.bindings.write();
        if !bindings.contains(&binding) {
            debug!(queue, key, exchange, "queue bound");
            bindings.push(binding);
        }

        Ok(())
    }

    /// Route a message to every queue bound to `exchange` under a matching
    /// key. The default exchange routes to the queue named `key`.
    pub(crate) fn route(&self, exchange: &str, key: &str, publishing: &Publishing) -> Result<(), TransportError> {
        let targets: Vec<Arc<Queue>> = if exchange.is_empty() {
            self.queues
                .get(key)
                .map(|queue| vec![Arc::clone(&queue)])
                .unwrap_or_default()
        } else {
            let kind = self.exchanges.get(exchange).map(|kind| *kind).ok_or_else(|| {
                TransportError::Channel(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;

            let mut names: Vec<String> = self
                .bindings
                .read()
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.key, key))
                .map(|b| b.queue.clone())
                .collect();
            names.sort();
            names.dedup();

            names
                .iter()
                .filter_map(|name| self.queues.get(name).map(|queue| Arc::clone(&queue)))
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, key, "message unroutable, dropped");
        }

        for queue in targets {
            queue.enqueue(Message {
                exchange: exchange.to_string(),
                routing_key: key.to_string(),
                publishing: publishing.clone(),
                redelivered: false,
            });
        }

        Ok(())
    }

    pub(crate) fn close_channel(&self, connection: &ConnectionState, channel: &ChannelState) {
        connection.channels.remove(&channel.id());
        let requeued = channel.close();
        if requeued > 0 {
            debug!(channel = channel.id(), requeued, "requeued unsettled deliveries");
        }
    }

    pub(crate) fn close_connection(&self, connection: &ConnectionState, err: Option<TransportError>) {
        self.connections.remove(&connection.id());
        connection.shutdown(err);

        let channels: Vec<Arc<ChannelState>> = connection
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in channels {
            self.close_channel(connection, &channel);
        }
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(key, binding_key),
    }
}

/// Topic exchange matching: `*` is exactly one word, `#` is zero or more.
#[must_use]
pub fn topic_matches(key: &str, pattern: &str) -> bool {
    let key: Vec<&str> = key.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();

    words_match(&key, &pattern)
}

fn words_match(key: &[&str], pattern: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(&key[skip..], rest)),
        Some((&"*", rest)) => !key.is_empty() && words_match(&key[1..], rest),
        Some((word, rest)) => key.first() == Some(word) && words_match(&key[1..], rest),
    }
}

/// An in-process topic broker.
///
/// Cloning is cheap; clones share the same exchanges, queues and
/// connections.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    pub(crate) state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                connections: DashMap::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Counters of `queue`, if it was declared.
    #[must_use]
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.state.queues.get(queue).map(|queue| queue.stats())
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Drop every connection as if the network failed. Close notifications
    /// fire, consume feeds end and unsettled deliveries are requeued.
    ///
    /// Returns the number of connections killed.
    pub fn kill_connections(&self) -> usize {
        let connections: Vec<Arc<ConnectionState>> = self
            .state
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for connection in &connections {
            self.state.close_connection(
                connection,
                Some(TransportError::Connection(
                    "CONNECTION_FORCED - broker forced connection closure".to_string(),
                )),
            );
        }

        warn!(count = connections.len(), "killed broker connections");
        connections.len()
    }

    /// Close every open channel, leaving connections up.
    ///
    /// Returns the number of channels closed.
    pub fn close_channels(&self) -> usize {
        let mut closed = 0;

        for connection in self.state.connections.iter() {
            let channels: Vec<Arc<ChannelState>> = connection
                .channels
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for channel in channels {
                self.state.close_channel(connection.value(), &channel);
                closed += 1;
            }
        }

        info!(closed, "closed broker channels");
        closed
    }

    /// Accept or refuse new connections.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Release);
    }
}
