//! Request/reply and event dispatch over a topic-exchange message broker.
//!
//! A [`Client`] owns one broker connection, rebuilt in the background
//! whenever it is lost, and a pool of protocol channels shared by everything
//! running on it. Subscriptions bind a queue to an exchange and run a number
//! of workers that hand each delivery to a [`Subscriber`]: decode, invoke the
//! business [`Endpoint`], encode and publish the reply. Failures become
//! uniform `{"error": {...}}` replies through an [`ErrorEncoder`].
//!
//! # Features
//!
//! - **Reconnection**: fixed-delay redial until the client is closed
//! - **Channel pooling**: bounded, non-blocking reuse of protocol channels
//! - **Worker pools**: concurrent consumers per queue
//! - **Shared queues**: first-match wildcard routing between handlers
//! - **Tracing**: trace context carried in message headers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amqp_kit::{
//!     BoxError, Channel, Client, Config, Delivery, Endpoint, Publishing, ReplyContext,
//!     SubscribeInfo, Subscriber, Transport,
//! };
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! #[derive(Serialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! struct GreetEndpoint;
//!
//! #[async_trait]
//! impl Endpoint for GreetEndpoint {
//!     type Request = Greet;
//!     type Response = Greeting;
//!
//!     async fn decode(&self, _cx: &ReplyContext, delivery: &Delivery) -> Result<Greet, BoxError> {
//!         amqp_kit::decode_json(delivery)
//!     }
//!
//!     async fn invoke(&self, _cx: &ReplyContext, request: Greet) -> Result<Greeting, BoxError> {
//!         Ok(Greeting {
//!             text: format!("hello, {}", request.name),
//!         })
//!     }
//!
//!     async fn encode(
//!         &self,
//!         cx: &ReplyContext,
//!         delivery: &Delivery,
//!         channel: &dyn Channel,
//!         publishing: &mut Publishing,
//!         response: Greeting,
//!     ) -> Result<(), BoxError> {
//!         amqp_kit::encode_json_response(cx, delivery, channel, publishing, &response).await
//!     }
//! }
//!
//! async fn example(transport: Arc<dyn Transport>) -> Result<(), amqp_kit::Error> {
//!     let client = Client::connect(transport, Config::default()).await?;
//!
//!     client.serve(vec![
//!         SubscribeInfo::new("greeter_greet", "greeter", Subscriber::new(GreetEndpoint))
//!             .workers(4),
//!     ])?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod error_encoder;
pub mod matcher;
pub mod middleware;
pub mod pool;
pub mod propagation;
pub mod publisher;
pub mod subscriber;
pub mod subscription;
pub mod transport;

/// Content type of every message built by the framework.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// Re-export commonly used types
pub use client::{Client, declare_and_bind};
pub use config::Config;
pub use connection::{BrokerConnection, ConnectionManager};
pub use error::{BoxError, CodedError, Error, Response, Result};
pub use error_encoder::{
    ErrorEncoder, NackRequeueErrorEncoder, ReplyAndAckErrorEncoder, ReplyErrorEncoder,
};
pub use middleware::{
    AckAfterEndpoint, ReplyContext, RequestFunc, ResponseFunc, set_correlation_id,
    set_publish_exchange, set_publish_key,
};
pub use pool::{ChannelPool, PooledChannel};
pub use propagation::Traced;
pub use publisher::{ChannelPublisher, Publisher};
pub use subscriber::{
    DeliveryHandler, Endpoint, Subscriber, decode_json, encode_json_response, encode_nop_response,
};
pub use subscription::{Route, SubscribeInfo};
pub use transport::{
    Acker, Channel, Connection, Delivery, DeliveryMode, DeliveryStream, ExchangeKind, Headers,
    Publishing, QueueInfo, Transport, TransportError,
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use http::StatusCode;
