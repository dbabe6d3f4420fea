//! Broker connection lifecycle and reconnection.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::{ChannelPool, PooledChannel};
use crate::transport::{Connection, Transport, TransportError};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// One live broker connection and its channel pool.
pub struct BrokerConnection {
    connection: Arc<dyn Connection>,
    pool: ChannelPool,
    closed: AtomicBool,
}

impl BrokerConnection {
    async fn open(
        transport: &dyn Transport,
        uri: &str,
        pool_size: usize,
    ) -> Result<(Arc<Self>, oneshot::Receiver<TransportError>)> {
        let connection = transport.connect(uri).await?;
        let closed_rx = connection.notify_close();
        let pool = ChannelPool::new(Arc::clone(&connection), pool_size);

        let broker = Arc::new(Self {
            connection,
            pool,
            closed: AtomicBool::new(false),
        });

        Ok((broker, closed_rx))
    }

    /// Check a channel out of the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or a channel cannot be
    /// opened.
    pub async fn get_channel(&self) -> Result<PooledChannel> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        Ok(self.pool.get().await?)
    }

    /// Return a channel to the pool.
    pub async fn put_channel(&self, channel: PooledChannel) {
        if self.is_closed() {
            channel.mark_errored();
        }

        self.pool.put(channel).await;
    }

    /// Open a throw-away channel and close it again.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    pub async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        let channel = self.connection.open_channel().await?;
        channel.close().await?;

        Ok(())
    }

    /// Whether the connection is known to be dead.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn mark_lost(&self) {
        self.closed.store(true, Ordering::Release);
        self.pool.clear().await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.pool.clear().await;
        self.connection.close().await?;

        Ok(())
    }
}

/// Owns the current [`BrokerConnection`] and replaces it after a loss.
///
/// Users of the connection only ever hold the read side of the lock, the
/// reconnect path takes the write side to swap in a new connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: Config,
    current: RwLock<Option<Arc<BrokerConnection>>>,
    stop: CancellationToken,
    tasks: TaskTracker,
    terminated: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager. Nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Config,
        stop: CancellationToken,
        tasks: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            current: RwLock::new(None),
            stop,
            tasks,
            terminated: AtomicBool::new(false),
        })
    }

    /// Dial the broker and start watching the connection for loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial fails.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let closed_rx = self.dial().await?;

        let manager = Arc::downgrade(self);
        let stop = self.stop.clone();
        self.tasks.spawn(watch(manager, closed_rx, stop));

        Ok(())
    }

    async fn dial(&self) -> Result<oneshot::Receiver<TransportError>> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let uri = self.config.dsn()?;
        let (broker, closed_rx) =
            BrokerConnection::open(self.transport.as_ref(), &uri, self.config.pool_size()).await?;

        let previous = self.current.write().replace(broker);
        if let Some(previous) = previous {
            previous.mark_lost().await;
        }

        info!(address = %self.config.address, "connected to broker");

        Ok(closed_rx)
    }

    /// The current connection.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is established or it is known to be
    /// lost.
    pub fn current(&self) -> Result<Arc<BrokerConnection>> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        match self.current.read().as_ref() {
            Some(broker) if !broker.is_closed() => Ok(Arc::clone(broker)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Check a channel out of the current connection's pool.
    ///
    /// A failed checkout is retried up to the configured count without
    /// waiting in between.
    ///
    /// # Errors
    ///
    /// Returns the last error once every attempt failed.
    pub async fn get_channel(&self) -> Result<(Arc<BrokerConnection>, PooledChannel)> {
        let mut last_error = Error::NotConnected;

        for attempt in 1..=self.config.retry_count() {
            let broker = match self.current() {
                Ok(broker) => broker,
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            match broker.get_channel().await {
                Ok(channel) => return Ok((broker, channel)),
                Err(e) => {
                    warn!(attempt, "channel checkout failed: {}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Whether a live connection is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    /// Reconnect after the connection reported `err`, until a dial succeeds
    /// or the stop token fires.
    ///
    /// Returns the close notification of the new connection.
    async fn on_close_with_err(&self, err: TransportError) -> Option<oneshot::Receiver<TransportError>> {
        warn!("broker connection closed: {}", err);

        let delay = self.config.reconnect_delay();
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    debug!("stop requested, abandoning reconnect");
                    return None;
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            let dialed = tokio::select! {
                () = self.stop.cancelled() => {
                    debug!(attempt, "stop requested during reconnect dial");
                    return None;
                }
                dialed = self.dial() => dialed,
            };
            match dialed {
                Ok(closed_rx) => {
                    info!(attempt, "reconnected to broker");
                    return Some(closed_rx);
                }
                Err(Error::Closed) => return None,
                Err(e) => warn!(attempt, "reconnect failed: {}", e),
            }
        }
    }

    /// Close the current connection. The manager cannot be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close the connection.
    pub async fn close(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let current = self.current.write().take();
        if let Some(broker) = current {
            broker.close().await?;
        }

        Ok(())
    }
}

async fn watch(
    manager: Weak<ConnectionManager>,
    mut closed_rx: oneshot::Receiver<TransportError>,
    stop: CancellationToken,
) {
    loop {
        let err = tokio::select! {
            () = stop.cancelled() => return,
            notification = &mut closed_rx => match notification {
                Ok(err) => err,
                Err(_) => {
                    debug!("connection closed locally, watcher exiting");
                    return;
                }
            },
        };

        let Some(manager) = manager.upgrade() else {
            return;
        };

        let current = manager.current.read().clone();
        if let Some(broker) = current {
            broker.mark_lost().await;
        }

        match manager.on_close_with_err(err).await {
            Some(next) => closed_rx = next,
            None => {
                debug!("connection watcher stopped");
                return;
            }
        }
    }
}
