//! Per-delivery reply context and the functions that run around an endpoint.

use crate::transport::{Channel, Delivery, Publishing};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Reply target and cancellation scope of one delivery.
///
/// A fresh context is created for every delivery. It carries the exchange
/// and routing key the reply goes to, and the trace context extracted from
/// the delivery headers.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    cancellation: CancellationToken,
    exchange: Option<String>,
    key: Option<String>,
    trace: opentelemetry::Context,
}

impl ReplyContext {
    /// Create a context scoped to `cancellation`.
    #[must_use]
    pub const fn new(cancellation: CancellationToken, trace: opentelemetry::Context) -> Self {
        Self {
            cancellation,
            exchange: None,
            key: None,
            trace,
        }
    }

    /// Token cancelled once the delivery has been handled.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Trace context carried by the delivery.
    #[must_use]
    pub const fn trace_context(&self) -> &opentelemetry::Context {
        &self.trace
    }

    /// Override the reply exchange.
    pub fn set_publish_exchange(&mut self, exchange: impl Into<String>) {
        self.exchange = Some(exchange.into());
    }

    /// Override the reply routing key.
    pub fn set_publish_key(&mut self, key: impl Into<String>) {
        self.key = Some(key.into());
    }

    /// Exchange the reply is published to. Defaults to the default exchange.
    #[must_use]
    pub fn reply_exchange(&self) -> &str {
        self.exchange.as_deref().unwrap_or_default()
    }

    /// Routing key the reply is published with. Defaults to the delivery's
    /// reply-to field.
    #[must_use]
    pub fn reply_key<'a>(&'a self, delivery: &'a Delivery) -> &'a str {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => &delivery.reply_to,
        }
    }
}

/// Runs before a request is decoded.
pub trait RequestFunc: Send + Sync + 'static {
    /// Adjust the reply context or the outgoing publishing.
    fn before(&self, cx: &mut ReplyContext, publishing: &mut Publishing);
}

impl<F> RequestFunc for F
where
    F: Fn(&mut ReplyContext, &mut Publishing) + Send + Sync + 'static,
{
    fn before(&self, cx: &mut ReplyContext, publishing: &mut Publishing) {
        self(cx, publishing);
    }
}

/// Runs after the endpoint succeeded and before the response is encoded.
#[async_trait]
pub trait ResponseFunc: Send + Sync + 'static {
    /// Act on the delivery or adjust the reply.
    async fn after(
        &self,
        cx: &mut ReplyContext,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
    );
}

/// Route replies to `exchange`.
pub fn set_publish_exchange(exchange: impl Into<String>) -> impl RequestFunc {
    let exchange = exchange.into();
    move |cx: &mut ReplyContext, _: &mut Publishing| cx.set_publish_exchange(exchange.clone())
}

/// Route replies with `key` instead of the delivery's reply-to.
pub fn set_publish_key(key: impl Into<String>) -> impl RequestFunc {
    let key = key.into();
    move |cx: &mut ReplyContext, _: &mut Publishing| cx.set_publish_key(key.clone())
}

/// Stamp replies with a fixed correlation id.
pub fn set_correlation_id(correlation_id: impl Into<String>) -> impl RequestFunc {
    let correlation_id = correlation_id.into();
    move |_: &mut ReplyContext, publishing: &mut Publishing| {
        publishing.correlation_id.clone_from(&correlation_id);
    }
}

/// Acknowledges the delivery as soon as the endpoint succeeded, before any
/// reply is published.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckAfterEndpoint {
    /// Acknowledge every earlier delivery on the channel as well.
    pub multiple: bool,
}

#[async_trait]
impl ResponseFunc for AckAfterEndpoint {
    async fn after(
        &self,
        _cx: &mut ReplyContext,
        delivery: &Delivery,
        _channel: &dyn Channel,
        _publishing: &mut Publishing,
    ) {
        if let Err(e) = delivery.ack(self.multiple).await {
            warn!(routing_key = %delivery.routing_key, "ack after endpoint failed: {}", e);
        }
    }
}
