//! Serving deliveries with a business endpoint.

use crate::error::BoxError;
use crate::error_encoder::{ErrorEncoder, ReplyAndAckErrorEncoder};
use crate::middleware::{ReplyContext, RequestFunc, ResponseFunc};
use crate::propagation;
use crate::transport::{Channel, Delivery, Publishing};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Business logic behind a subscription.
///
/// The framework only depends on this capability: how a request is decoded
/// from a delivery, what is done with it, and how the response goes back.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Decoded request.
    type Request: Send;
    /// Endpoint result.
    type Response: Send;

    /// Decode the delivery body.
    async fn decode(&self, cx: &ReplyContext, delivery: &Delivery) -> Result<Self::Request, BoxError>;

    /// Run the business logic.
    async fn invoke(&self, cx: &ReplyContext, request: Self::Request) -> Result<Self::Response, BoxError>;

    /// Encode and publish the response.
    async fn encode(
        &self,
        cx: &ReplyContext,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
        response: Self::Response,
    ) -> Result<(), BoxError>;
}

/// Object-safe handler for deliveries taken from one queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Serve one delivery. Replies go out on `channel`.
    async fn serve_delivery(&self, channel: &dyn Channel, delivery: Delivery);
}

/// Wraps an [`Endpoint`] with middleware and an error encoder.
pub struct Subscriber<E: Endpoint> {
    endpoint: E,
    before: Vec<Arc<dyn RequestFunc>>,
    after: Vec<Arc<dyn ResponseFunc>>,
    error_encoder: Arc<dyn ErrorEncoder>,
}

impl<E: Endpoint> Subscriber<E> {
    /// Create a subscriber replying errors with [`ReplyAndAckErrorEncoder`].
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            before: Vec::new(),
            after: Vec::new(),
            error_encoder: Arc::new(ReplyAndAckErrorEncoder),
        }
    }

    /// Append a function run before decoding.
    #[must_use]
    pub fn before(mut self, f: impl RequestFunc) -> Self {
        self.before.push(Arc::new(f));
        self
    }

    /// Append a function run after the endpoint succeeded.
    #[must_use]
    pub fn after(mut self, f: impl ResponseFunc) -> Self {
        self.after.push(Arc::new(f));
        self
    }

    /// Replace the error encoder.
    #[must_use]
    pub fn error_encoder(mut self, encoder: impl ErrorEncoder) -> Self {
        self.error_encoder = Arc::new(encoder);
        self
    }

    async fn fail(
        &self,
        cx: &ReplyContext,
        err: BoxError,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
    ) {
        self.error_encoder
            .encode_error(cx, err, delivery, channel, publishing)
            .await;

        if delivery.is_settled() {
            return;
        }
        if let Err(e) = delivery.ack(false).await {
            warn!(routing_key = %delivery.routing_key, "ack after error failed: {}", e);
        }
    }
}

#[async_trait]
impl<E: Endpoint> DeliveryHandler for Subscriber<E> {
    async fn serve_delivery(&self, channel: &dyn Channel, delivery: Delivery) {
        let cancellation = CancellationToken::new();
        let _scope = cancellation.clone().drop_guard();

        let trace = propagation::extract_context(&delivery.headers);
        let mut cx = ReplyContext::new(cancellation, trace);
        let mut publishing = Publishing {
            content_type: crate::JSON_CONTENT_TYPE.to_string(),
            ..Publishing::default()
        };

        for f in &self.before {
            f.before(&mut cx, &mut publishing);
        }

        let request = match self.endpoint.decode(&cx, &delivery).await {
            Ok(request) => request,
            Err(err) => {
                self.fail(&cx, err, &delivery, channel, &mut publishing).await;
                return;
            }
        };

        let response = match self.endpoint.invoke(&cx, request).await {
            Ok(response) => response,
            Err(err) => {
                self.fail(&cx, err, &delivery, channel, &mut publishing).await;
                return;
            }
        };

        for f in &self.after {
            f.after(&mut cx, &delivery, channel, &mut publishing).await;
        }

        if let Err(err) = self
            .endpoint
            .encode(&cx, &delivery, channel, &mut publishing, response)
            .await
        {
            self.fail(&cx, err, &delivery, channel, &mut publishing).await;
            return;
        }

        if let Err(e) = delivery.ack(false).await {
            warn!(routing_key = %delivery.routing_key, "ack after reply failed: {}", e);
        }
    }
}

/// Deserialize a JSON delivery body.
///
/// # Errors
///
/// Returns an error if the body is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(delivery: &Delivery) -> Result<T, BoxError> {
    Ok(serde_json::from_slice(&delivery.body)?)
}

/// Serialize `response` as JSON and publish it to the reply target.
///
/// The delivery's correlation id is used unless one was already set.
///
/// # Errors
///
/// Returns an error if serialization or publishing fails.
pub async fn encode_json_response<T: Serialize + Sync>(
    cx: &ReplyContext,
    delivery: &Delivery,
    channel: &dyn Channel,
    publishing: &mut Publishing,
    response: &T,
) -> Result<(), BoxError> {
    if publishing.correlation_id.is_empty() {
        publishing.correlation_id.clone_from(&delivery.correlation_id);
    }

    publishing.body = Bytes::from(serde_json::to_vec(response)?);

    channel
        .publish(
            cx.reply_exchange(),
            cx.reply_key(delivery),
            false,
            false,
            publishing,
        )
        .await?;

    Ok(())
}

/// Encoder for endpoints that never reply.
///
/// # Errors
///
/// Never fails.
pub fn encode_nop_response() -> Result<(), BoxError> {
    Ok(())
}
