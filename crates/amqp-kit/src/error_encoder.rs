//! Turning handler failures into replies and settlement decisions.

use crate::error::{BoxError, CodedError, Response};
use crate::middleware::ReplyContext;
use crate::transport::{Channel, Delivery, Publishing};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{error, warn};

/// Handles an error raised while serving a delivery.
///
/// An encoder may settle the delivery. The subscriber acknowledges any
/// delivery still unsettled once the encoder returns.
#[async_trait]
pub trait ErrorEncoder: Send + Sync + 'static {
    /// Encode `err` and settle `delivery`.
    async fn encode_error(
        &self,
        cx: &ReplyContext,
        err: BoxError,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
    );
}

/// Publishes `{"error": {...}}` to the reply target and leaves settlement to
/// the subscriber, which acknowledges the delivery afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyErrorEncoder;

#[async_trait]
impl ErrorEncoder for ReplyErrorEncoder {
    async fn encode_error(
        &self,
        cx: &ReplyContext,
        err: BoxError,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
    ) {
        if publishing.correlation_id.is_empty() {
            publishing.correlation_id.clone_from(&delivery.correlation_id);
        }

        let response = Response::<()>::error(CodedError::from_boxed(err));
        match serde_json::to_vec(&response) {
            Ok(body) => publishing.body = Bytes::from(body),
            Err(e) => {
                error!("encoding error reply: {}", e);
                return;
            }
        }

        let exchange = cx.reply_exchange();
        let key = cx.reply_key(delivery);
        if let Err(e) = channel.publish(exchange, key, false, false, publishing).await {
            warn!(exchange, key, "publishing error reply failed: {}", e);
        }
    }
}

/// Replies like [`ReplyErrorEncoder`], then acknowledges the delivery.
///
/// This is the default encoder of a subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyAndAckErrorEncoder;

#[async_trait]
impl ErrorEncoder for ReplyAndAckErrorEncoder {
    async fn encode_error(
        &self,
        cx: &ReplyContext,
        err: BoxError,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
    ) {
        ReplyErrorEncoder
            .encode_error(cx, err, delivery, channel, publishing)
            .await;

        if let Err(e) = delivery.ack(false).await {
            warn!(routing_key = %delivery.routing_key, "ack after error reply failed: {}", e);
        }
    }
}

/// Requeues the delivery without replying, then pauses the worker for
/// `delay` so a message that keeps failing is not retried in a tight loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NackRequeueErrorEncoder {
    /// Pause after the nack.
    pub delay: Duration,
}

impl NackRequeueErrorEncoder {
    /// Create an encoder pausing for `delay`.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ErrorEncoder for NackRequeueErrorEncoder {
    async fn encode_error(
        &self,
        _cx: &ReplyContext,
        err: BoxError,
        delivery: &Delivery,
        _channel: &dyn Channel,
        _publishing: &mut Publishing,
    ) {
        warn!(routing_key = %delivery.routing_key, "requeueing delivery: {}", err);

        if let Err(e) = delivery.nack(false, true).await {
            warn!(routing_key = %delivery.routing_key, "nack failed: {}", e);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}
