//! Broker client: serving subscriptions and publishing.

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::pool::PooledChannel;
use crate::propagation;
use crate::publisher::Publisher;
use crate::subscription::SubscribeInfo;
use crate::transport::{Channel, ExchangeKind, Publishing, Transport};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Declare a durable topic exchange and a durable queue, set the prefetch
/// count, and bind the queue under every key.
///
/// # Errors
///
/// Returns the first failing broker operation.
pub async fn declare_and_bind<'a>(
    channel: &dyn Channel,
    exchange: &str,
    queue: &str,
    keys: impl IntoIterator<Item = &'a str> + Send,
    prefetch_count: u16,
) -> Result<()> {
    channel
        .declare_exchange(exchange, ExchangeKind::Topic, true)
        .await?;
    channel.declare_queue(queue, true).await?;
    channel.qos(prefetch_count, 0, false).await?;

    for key in keys {
        channel.bind(queue, key, exchange).await?;
    }

    Ok(())
}

struct ClientInner {
    config: Config,
    manager: Arc<ConnectionManager>,
    queues: Mutex<HashSet<String>>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

/// Serves subscriptions and publishes messages over one managed broker
/// connection.
///
/// Cloning is cheap; clones share the connection and the workers.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client {
    /// Connect to the broker described by `config`.
    ///
    /// Only this first dial reports failure; later connection losses are
    /// retried in the background until the client is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached.
    pub async fn connect(transport: Arc<dyn Transport>, config: Config) -> Result<Self> {
        let stop = CancellationToken::new();
        let tasks = TaskTracker::new();
        let manager = ConnectionManager::new(transport, config.clone(), stop.clone(), tasks.clone());

        manager.connect().await?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                manager,
                queues: Mutex::new(HashSet::new()),
                stop,
                tasks,
            }),
        })
    }

    /// Start workers for every subscription.
    ///
    /// A queue registered twice, within this call or by an earlier one, is
    /// rejected and no worker of this call is started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateQueue`] or [`Error::Closed`].
    #[instrument(skip_all)]
    pub fn serve(&self, subscriptions: Vec<SubscribeInfo>) -> Result<()> {
        if self.inner.stop.is_cancelled() {
            return Err(Error::Closed);
        }

        {
            let mut registered = self.inner.queues.lock();
            let mut batch = HashSet::new();

            for sub in &subscriptions {
                if registered.contains(&sub.queue) || !batch.insert(sub.queue.clone()) {
                    error!(queue = %sub.queue, "duplicate queue entry");
                    return Err(Error::DuplicateQueue(sub.queue.clone()));
                }
            }

            registered.extend(batch);
        }

        info!("subscribers checked");

        for sub in subscriptions {
            let sub = Arc::new(sub);
            for worker in 0..sub.workers {
                let client = self.clone();
                let sub = Arc::clone(&sub);
                self.inner
                    .tasks
                    .spawn(async move { client.run_worker(&sub, worker).await });
            }
        }

        Ok(())
    }

    async fn run_worker(&self, sub: &SubscribeInfo, worker: usize) {
        let stop = &self.inner.stop;
        let retry_after = self.inner.config.consume_retry_delay();

        loop {
            if stop.is_cancelled() {
                break;
            }

            if let Err(e) = self.receive(sub, worker).await {
                error!(queue = %sub.queue, name = %sub.name, exchange = %sub.exchange, worker, "receive failed: {}", e);
            }

            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(retry_after) => {}
            }
        }

        info!(queue = %sub.queue, name = %sub.name, worker, "worker stopped");
    }

    async fn receive(&self, sub: &SubscribeInfo, worker: usize) -> Result<()> {
        let (broker, channel) = self.inner.manager.get_channel().await?;

        let result = self.consume(&channel, sub, worker).await;
        if result.is_err() {
            channel.mark_errored();
        }
        broker.put_channel(channel).await;

        result
    }

    async fn consume(&self, channel: &PooledChannel, sub: &SubscribeInfo, worker: usize) -> Result<()> {
        declare_and_bind(
            &**channel,
            &sub.exchange,
            &sub.queue,
            sub.keys(),
            self.inner.config.prefetch(),
        )
        .await?;

        let mut deliveries = channel.consume(&sub.queue, &sub.consumer_tag(worker)).await?;
        debug!(queue = %sub.queue, worker, "consuming");

        loop {
            tokio::select! {
                biased;
                () = self.inner.stop.cancelled() => return Ok(()),
                next = deliveries.next() => match next {
                    Some(delivery) => sub.dispatch(&**channel, delivery).await,
                    None => return Err(Error::FeedClosed),
                },
            }
        }
    }

    #[instrument(skip(self, msg), fields(correlation_id = %msg.correlation_id))]
    async fn send(&self, exchange: &str, key: &str, msg: &Publishing) -> Result<()> {
        let (broker, channel) = self.inner.manager.get_channel().await?;

        let result = channel.publish(exchange, key, false, false, msg).await;
        if result.is_err() {
            channel.mark_errored();
        }
        broker.put_channel(channel).await;

        Ok(result?)
    }

    /// Check that a channel can be opened on the current connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable.
    pub async fn ping(&self) -> Result<()> {
        self.inner.manager.current()?.ping().await
    }

    /// Whether a live broker connection is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_connected()
    }

    /// Stop every worker, end reconnection and close the connection.
    ///
    /// Workers finish the delivery they are handling first. Closing twice is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails to close cleanly.
    pub async fn close(&self) -> Result<()> {
        if self.inner.stop.is_cancelled() {
            return Ok(());
        }

        self.inner.stop.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Err(e) = self.inner.manager.close().await {
            warn!("closing broker connection: {}", e);
            return Err(e);
        }

        info!("client closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for Client {
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
