//! Broker transport abstraction.
//!
//! The framework never talks to a broker client directly. Backends implement
//! [`Transport`], [`Connection`] and [`Channel`] (see the `amqp-kit-memory`
//! and `amqp-kit-lapin` crates) and hand deliveries over as [`Delivery`]
//! values.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// Message headers. Only string values are carried.
pub type Headers = HashMap<String, String>;

/// Feed of deliveries from one consumer. The stream ending means the feed
/// was closed by the broker, the channel or the connection.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Errors reported by transports.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The protocol channel failed; the connection may still be usable.
    #[error("channel error: {0}")]
    Channel(String),

    /// The broker connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The channel or connection is already closed.
    #[error("closed")]
    Closed,

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether a fresh protocol channel may succeed where this one failed.
    #[must_use]
    pub const fn is_channel_error(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Closed)
    }
}

/// Exchange kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing key match.
    Direct,
    /// Broadcast to every bound queue.
    Fanout,
    /// Dot-segmented wildcard routing.
    Topic,
}

/// Message persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only.
    #[default]
    Transient,
    /// Written to disk by the broker.
    Persistent,
}

impl DeliveryMode {
    /// Wire value of the mode.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Ready messages at declaration time.
    pub messages: u32,
    /// Active consumers at declaration time.
    pub consumers: u32,
}

/// One outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publishing {
    /// MIME type of the body.
    pub content_type: String,
    /// Correlation identifier.
    pub correlation_id: String,
    /// Reply routing hint.
    pub reply_to: String,
    /// Persistence flag.
    pub delivery_mode: DeliveryMode,
    /// Headers, including tracing headers.
    pub headers: Headers,
    /// Payload.
    pub body: Bytes,
}

impl Publishing {
    /// A persistent JSON message.
    #[must_use]
    pub fn json(correlation_id: impl Into<String>, body: Bytes) -> Self {
        Self {
            content_type: crate::JSON_CONTENT_TYPE.to_string(),
            correlation_id: correlation_id.into(),
            delivery_mode: DeliveryMode::Persistent,
            body,
            ..Self::default()
        }
    }
}

/// Settlement capability of one delivery.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    /// Positive acknowledgement.
    async fn ack(&self, multiple: bool) -> Result<(), TransportError>;

    /// Negative acknowledgement.
    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError>;

    /// Rejection of a single delivery.
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One inbound message.
///
/// A delivery is settled at most once: the first of [`ack`](Self::ack),
/// [`nack`](Self::nack) or [`reject`](Self::reject) reaches the broker and
/// returns `Ok(true)`, later calls are ignored and return `Ok(false)`. Clones
/// share the settlement state.
#[derive(Clone)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Correlation identifier.
    pub correlation_id: String,
    /// Reply routing hint.
    pub reply_to: String,
    /// MIME type of the body.
    pub content_type: String,
    /// Headers.
    pub headers: Headers,
    /// Payload.
    pub body: Bytes,
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    acker: Arc<dyn Acker>,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    /// Create an empty delivery settled through `acker`.
    pub fn new(acker: Arc<dyn Acker>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: String::new(),
            correlation_id: String::new(),
            reply_to: String::new(),
            content_type: String::new(),
            headers: Headers::new(),
            body: Bytes::new(),
            delivery_tag: 0,
            redelivered: false,
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether an ack, nack or reject was already issued.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the acknowledgement.
    pub async fn ack(&self, multiple: bool) -> Result<bool, TransportError> {
        if !self.claim("ack") {
            return Ok(false);
        }
        self.acker.ack(multiple).await.map(|()| true)
    }

    /// Negatively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the acknowledgement.
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<bool, TransportError> {
        if !self.claim("nack") {
            return Ok(false);
        }
        self.acker.nack(multiple, requeue).await.map(|()| true)
    }

    /// Reject the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the rejection.
    pub async fn reject(&self, requeue: bool) -> Result<bool, TransportError> {
        if !self.claim("reject") {
            return Ok(false);
        }
        self.acker.reject(requeue).await.map(|()| true)
    }

    fn claim(&self, action: &str) -> bool {
        let first = !self.settled.swap(true, Ordering::AcqRel);
        if !first {
            warn!(
                delivery_tag = self.delivery_tag,
                routing_key = %self.routing_key,
                "ignoring {} of an already settled delivery",
                action
            );
        }
        first
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}

/// A multiplexed session within one broker connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare an exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Declare a queue.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueInfo, TransportError>;

    /// Limit unacknowledged deliveries.
    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), TransportError>;

    /// Bind `queue` to `exchange` under `key`.
    async fn bind(&self, queue: &str, key: &str, exchange: &str) -> Result<(), TransportError>;

    /// Start consuming `queue` with explicit acknowledgement.
    ///
    /// An empty `consumer_tag` lets the broker choose one.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    /// Publish one message.
    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        mandatory: bool,
        immediate: bool,
        msg: &Publishing,
    ) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a new protocol channel.
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    /// Subscribe to the connection-closed notification.
    ///
    /// The receiver yields the error when the broker or the network closes
    /// the connection. A local [`close`](Self::close) drops the sender
    /// instead.
    fn notify_close(&self) -> oneshot::Receiver<TransportError>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to the broker at `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>, TransportError>;
}
