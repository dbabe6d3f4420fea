//! Connections, channels and delivery settlement.

use crate::broker::{BrokerState, Consumer, Message, Queue};

use amqp_kit::{
    Acker, Channel, Connection, Delivery, DeliveryStream, ExchangeKind, Publishing, QueueInfo,
    TransportError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

struct Unsettled {
    queue: Arc<Queue>,
    message: Message,
}

/// Per-channel bookkeeping of deliveries awaiting settlement.
pub(crate) struct ChannelState {
    id: u64,
    closed: CancellationToken,
    unsettled: Mutex<BTreeMap<u64, Unsettled>>,
    next_tag: AtomicU64,
}

impl ChannelState {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Register a delivery. Returns `None`, requeueing the message, if the
    /// channel closed meanwhile.
    fn track(self: &Arc<Self>, queue: &Arc<Queue>, message: Message) -> Option<Delivery> {
        let mut unsettled = self.unsettled.lock();
        if self.closed.is_cancelled() {
            queue.requeue(message);
            return None;
        }

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;

        let mut delivery = Delivery::new(Arc::new(MemoryAcker {
            channel: Arc::clone(self),
            tag,
        }));
        delivery.exchange.clone_from(&message.exchange);
        delivery.routing_key.clone_from(&message.routing_key);
        delivery.correlation_id.clone_from(&message.publishing.correlation_id);
        delivery.reply_to.clone_from(&message.publishing.reply_to);
        delivery.content_type.clone_from(&message.publishing.content_type);
        delivery.headers.clone_from(&message.publishing.headers);
        delivery.body = message.publishing.body.clone();
        delivery.delivery_tag = tag;
        delivery.redelivered = message.redelivered;

        unsettled.insert(
            tag,
            Unsettled {
                queue: Arc::clone(queue),
                message,
            },
        );

        Some(delivery)
    }

    fn settle(&self, tag: u64, multiple: bool) -> Result<Vec<Unsettled>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut unsettled = self.unsettled.lock();
        if multiple {
            let rest = unsettled.split_off(&(tag + 1));
            let settled = std::mem::replace(&mut *unsettled, rest);
            if settled.is_empty() {
                return Err(unknown_tag(tag));
            }
            Ok(settled.into_values().collect())
        } else {
            unsettled
                .remove(&tag)
                .map(|entry| vec![entry])
                .ok_or_else(|| unknown_tag(tag))
        }
    }

    /// Close the channel and requeue everything still unsettled.
    pub(crate) fn close(&self) -> usize {
        self.closed.cancel();

        let unsettled = std::mem::take(&mut *self.unsettled.lock());
        let count = unsettled.len();
        for entry in unsettled.into_values() {
            entry.queue.requeue(entry.message);
        }

        count
    }
}

fn unknown_tag(tag: u64) -> TransportError {
    TransportError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
}

struct MemoryAcker {
    channel: Arc<ChannelState>,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        for entry in self.channel.settle(self.tag, multiple)? {
            entry.queue.record_ack();
        }
        Ok(())
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        for entry in self.channel.settle(self.tag, multiple)? {
            if requeue {
                entry.queue.requeue(entry.message);
            } else {
                entry.queue.record_reject();
            }
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.nack(false, requeue).await
    }
}

/// Per-connection state shared with the broker.
pub(crate) struct ConnectionState {
    id: Uuid,
    closed: CancellationToken,
    notify: Mutex<Vec<oneshot::Sender<TransportError>>>,
    pub(crate) channels: DashMap<u64, Arc<ChannelState>>,
    next_channel: AtomicU64,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            closed: CancellationToken::new(),
            notify: Mutex::new(Vec::new()),
            channels: DashMap::new(),
            next_channel: AtomicU64::new(0),
        }
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    /// Mark the connection closed. With an error every close listener is
    /// told about it, without one the listeners are dropped.
    pub(crate) fn shutdown(&self, err: Option<TransportError>) {
        self.closed.cancel();

        let listeners = std::mem::take(&mut *self.notify.lock());
        if let Some(err) = err {
            for listener in listeners {
                let _ = listener.send(err.clone());
            }
        }
    }
}

/// Client side of an in-memory connection.
pub(crate) struct MemoryConnection {
    pub(crate) broker: Arc<BrokerState>,
    pub(crate) state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self.state.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let id = self.state.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(ChannelState {
            id,
            closed: self.state.closed.child_token(),
            unsettled: Mutex::new(BTreeMap::new()),
            next_tag: AtomicU64::new(0),
        });
        self.state.channels.insert(id, Arc::clone(&channel));

        debug!(connection = %self.state.id, channel = id, "channel opened");

        Ok(Box::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            connection: Arc::clone(&self.state),
            state: channel,
        }))
    }

    fn notify_close(&self) -> oneshot::Receiver<TransportError> {
        let (tx, rx) = oneshot::channel();
        if !self.state.closed.is_cancelled() {
            self.state.notify.lock().push(tx);
        }
        rx
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!(connection = %self.state.id, "closing connection");
        self.broker.close_connection(&self.state, None);
        Ok(())
    }
}

/// One channel of an in-memory connection.
struct MemoryChannel {
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    state: Arc<ChannelState>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Channel-level failures close the channel, as a real broker does.
    fn check<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_channel_error() {
                debug!(channel = self.state.id, "closing channel after error: {}", e);
                self.broker.close_channel(&self.connection, &self.state);
            }
        }
        result
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.check(self.broker.declare_exchange(name, kind))
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<QueueInfo, TransportError> {
        self.ensure_open()?;
        let queue = self.broker.declare_queue(name);

        Ok(QueueInfo {
            name: queue.name().to_string(),
            messages: u32::try_from(queue.receiver().len()).unwrap_or(u32::MAX),
            consumers: queue.consumer_count(),
        })
    }

    async fn qos(&self, prefetch_count: u16, _prefetch_size: u32, _global: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Deliveries are pulled as the consumer polls, so a consumer never
        // holds more than the one it is handling.
        debug!(channel = self.state.id, prefetch_count, "qos set");
        Ok(())
    }

    async fn bind(&self, queue: &str, key: &str, exchange: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.check(self.broker.bind(queue, key, exchange))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let queue = self.check(self.broker.queue(queue))?;

        let consumer_tag = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };
        debug!(queue = queue.name(), consumer_tag, "consumer started");

        let consumer = Consumer::new(queue);
        let channel = Arc::clone(&self.state);
        let stream = futures::stream::unfold((consumer, channel), |(consumer, channel)| async move {
            loop {
                let message = tokio::select! {
                    biased;
                    () = channel.closed.cancelled() => return None,
                    message = consumer.queue().receiver().recv_async() => message.ok()?,
                };

                if let Some(delivery) = channel.track(consumer.queue(), message) {
                    return Some((delivery, (consumer, channel)));
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        _mandatory: bool,
        _immediate: bool,
        msg: &Publishing,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.check(self.broker.route(exchange, key, msg))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.close_channel(&self.connection, &self.state);
        Ok(())
    }
}
