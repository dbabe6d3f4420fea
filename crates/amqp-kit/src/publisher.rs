//! Outbound publishing.

use crate::error::Result;
use crate::propagation;
use crate::transport::{Channel, Connection, Publishing};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Publishes persistent JSON messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `body` to `exchange` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be handed to the broker.
    async fn publish(&self, exchange: &str, key: &str, correlation_id: &str, body: Bytes) -> Result<()>;

    /// Publish like [`publish`](Self::publish) inside a producer span started
    /// under `cx`, carrying the span in the message headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be handed to the broker.
    async fn publish_with_tracing(
        &self,
        cx: &opentelemetry::Context,
        exchange: &str,
        key: &str,
        correlation_id: &str,
        body: Bytes,
    ) -> Result<()>;
}

/// Publisher bound to a single protocol channel of one connection.
///
/// A publish failing with a channel-level error is retried once on a fresh
/// channel.
pub struct ChannelPublisher {
    connection: Arc<dyn Connection>,
    channel: Mutex<Box<dyn Channel>>,
}

impl ChannelPublisher {
    /// Open a channel on `connection` for publishing.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened.
    pub async fn new(connection: Arc<dyn Connection>) -> Result<Self> {
        let channel = connection.open_channel().await?;

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
        })
    }

    #[instrument(skip(self, msg), fields(correlation_id = %msg.correlation_id))]
    async fn send(&self, exchange: &str, key: &str, msg: &Publishing) -> Result<()> {
        let mut channel = self.channel.lock().await;

        match channel.publish(exchange, key, false, false, msg).await {
            Err(e) if e.is_channel_error() => {
                debug!("publish failed with channel error, retrying on a new channel: {}", e);
                let stale = std::mem::replace(&mut *channel, self.connection.open_channel().await?);
                if let Err(e) = stale.close().await {
                    debug!("closing failed channel: {}", e);
                }
                channel.publish(exchange, key, false, false, msg).await?;
                Ok(())
            }
            result => Ok(result?),
        }
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, exchange: &str, key: &str, correlation_id: &str, body: Bytes) -> Result<()> {
        self.send(exchange, key, &Publishing::json(correlation_id, body))
            .await
    }

    async fn publish_with_tracing(
        &self,
        cx: &opentelemetry::Context,
        exchange: &str,
        key: &str,
        correlation_id: &str,
        body: Bytes,
    ) -> Result<()> {
        let mut msg = Publishing::json(correlation_id, body);
        let _span = propagation::start_publish_span(cx, exchange, key, correlation_id, &mut msg.headers);

        self.send(exchange, key, &msg).await
    }
}
