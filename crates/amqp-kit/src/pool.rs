//! Protocol channel pooling.

use crate::transport::{Channel, Connection, TransportError};

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// A protocol channel checked out of a [`ChannelPool`].
pub struct PooledChannel {
    channel: Box<dyn Channel>,
    errored: AtomicBool,
}

impl PooledChannel {
    fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            errored: AtomicBool::new(false),
        }
    }

    /// Record that an operation on this channel failed. The pool closes the
    /// channel instead of keeping it.
    pub fn mark_errored(&self) {
        self.errored.store(true, Ordering::Release);
    }

    /// Whether the channel recorded an error.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    async fn close(self) {
        if let Err(e) = self.channel.close().await {
            debug!("closing pooled channel: {}", e);
        }
    }
}

impl Deref for PooledChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("errored", &self.is_errored())
            .finish_non_exhaustive()
    }
}

/// Bounded pool of idle protocol channels for one connection.
///
/// Neither [`get`](Self::get) nor [`put`](Self::put) ever waits for another
/// caller: a miss opens a new channel and an overflow closes the returned one.
pub struct ChannelPool {
    connection: Arc<dyn Connection>,
    idle_tx: flume::Sender<PooledChannel>,
    idle_rx: flume::Receiver<PooledChannel>,
}

impl ChannelPool {
    /// Create an empty pool holding at most `size` idle channels.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>, size: usize) -> Self {
        let (idle_tx, idle_rx) = flume::bounded(size.max(1));

        Self {
            connection,
            idle_tx,
            idle_rx,
        }
    }

    /// Take an idle channel, or open a new one when none is idle.
    ///
    /// # Errors
    ///
    /// Returns an error if a new channel cannot be opened.
    pub async fn get(&self) -> Result<PooledChannel, TransportError> {
        if let Ok(channel) = self.idle_rx.try_recv() {
            return Ok(channel);
        }

        let channel = self.connection.open_channel().await?;
        debug!("opened protocol channel");

        Ok(PooledChannel::new(channel))
    }

    /// Return a channel. Errored channels and channels that do not fit are
    /// closed.
    pub async fn put(&self, channel: PooledChannel) {
        if channel.is_errored() {
            debug!("discarding errored channel");
            channel.close().await;
            return;
        }

        if let Err(e) = self.idle_tx.try_send(channel) {
            channel_from(e).close().await;
        }
    }

    /// Close every idle channel.
    pub async fn clear(&self) {
        let mut closed = 0usize;
        while let Ok(channel) = self.idle_rx.try_recv() {
            channel.close().await;
            closed += 1;
        }

        if closed > 0 {
            warn!("cleared {} pooled channels", closed);
        }
    }

    /// Number of idle channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.idle_rx.len()
    }

    /// Whether no channel is idle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idle_rx.is_empty()
    }
}

fn channel_from(err: flume::TrySendError<PooledChannel>) -> PooledChannel {
    match err {
        flume::TrySendError::Full(channel) | flume::TrySendError::Disconnected(channel) => channel,
    }
}
