//! Decorators intercepting the lifecycle of shared connections and cached channels.
//!
//! Every operation is forwarded to the wrapped physical resource, errors included,
//! except for `close`: closing a proxy hands the resource back to its owning factory.
//! Equality and hashing use proxy identity, never target identity.
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use super::{Channel, Connection, ConnectionError, DeliveryTag};

/// The owner of the channels handed out through a [`ConnectionProxy`].
#[async_trait::async_trait]
pub(crate) trait ChannelSource: Send + Sync {
    async fn open_channel(
        &self,
        connection: &ConnectionProxy,
        transactional: bool,
    ) -> Result<ChannelProxy, ConnectionError>;

    /// Take back a channel whose proxy has been closed.
    /// The source either caches it or closes it physically.
    async fn release_channel(&self, channel: ChannelProxy);
}

/// A shared connection.
///
/// `close` is a no-op: the physical connection is owned by the factory that created it
/// and is only closed when that factory is reset or disposed.
#[derive(Clone)]
pub struct ConnectionProxy {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    target: Arc<dyn Connection>,
    source: Weak<dyn ChannelSource>,
    generation: u64,
    description: String,
}

impl ConnectionProxy {
    pub(crate) fn new(
        target: Arc<dyn Connection>,
        source: Weak<dyn ChannelSource>,
        generation: u64,
        description: String,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                target,
                source,
                generation,
                description,
            }),
        }
    }

    /// Obtain a channel, transactional or not.
    ///
    /// Transactional channels have had `tx.select` issued exactly once, when they were
    /// physically opened.
    pub async fn create_channel(&self, transactional: bool) -> Result<ChannelProxy, ConnectionError> {
        match self.inner.source.upgrade() {
            Some(source) => source.open_channel(self, transactional).await,
            None => Err(ConnectionError::CreateChannel(anyhow::anyhow!(
                "The connection factory owning {} has been dropped",
                self.inner.description
            ))),
        }
    }

    /// Release the connection. The physical connection stays open.
    pub async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.target.is_open()
    }

    /// The physical connection, bypassing the proxy.
    pub fn target_connection(&self) -> &Arc<dyn Connection> {
        &self.inner.target
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Physically close the target. Failures are logged and swallowed.
    pub(crate) async fn close_target(&self) {
        debug!("Closing shared RabbitMq connection: {}", self.inner.description);
        if let Err(e) = self.inner.target.close().await {
            debug!("Could not close shared RabbitMq connection: {:?}", e);
        }
    }
}

#[async_trait::async_trait]
impl Connection for ConnectionProxy {
    async fn create_channel(&self) -> Result<Box<dyn Channel>, anyhow::Error> {
        let channel = ConnectionProxy::create_channel(self, false).await?;
        Ok(Box::new(channel))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        ConnectionProxy::close(self).await
    }

    fn is_open(&self) -> bool {
        ConnectionProxy::is_open(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PartialEq for ConnectionProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionProxy {}

impl Hash for ConnectionProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared RabbitMq connection: {}", self.inner.description)
    }
}

/// A channel borrowed from a connection factory.
///
/// Closing the proxy returns the channel to its factory, which decides whether to cache it
/// or to close it physically. A channel that is no longer open is dropped on `close`.
///
/// Each borrow hands out a fresh lease: once a borrow has been closed, closing it (or any
/// clone of it) again is ignored, even if the channel has since been lent to someone else.
#[derive(Clone)]
pub struct ChannelProxy {
    inner: Arc<ChannelInner>,
    returned: Arc<AtomicBool>,
}

struct ChannelInner {
    target: Arc<dyn Channel>,
    source: Weak<dyn ChannelSource>,
    transactional: bool,
    tx_selected: AtomicBool,
    generation: u64,
}

impl ChannelProxy {
    pub(crate) fn new(
        target: Arc<dyn Channel>,
        source: Weak<dyn ChannelSource>,
        transactional: bool,
        generation: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                target,
                source,
                transactional,
                tx_selected: AtomicBool::new(transactional),
                generation,
            }),
            returned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A new borrow of the same channel, handed out when it leaves the cache.
    pub(crate) fn reborrow(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            returned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The physical channel, bypassing the proxy.
    pub fn target_channel(&self) -> &Arc<dyn Channel> {
        &self.inner.target
    }

    /// Whether this channel was requested as transactional, i.e. which cache it belongs to.
    pub fn is_transactional(&self) -> bool {
        self.inner.transactional
    }

    /// Whether `tx.select` has been issued on the physical channel.
    pub fn is_tx_selected(&self) -> bool {
        self.inner.tx_selected.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Physically close the target. Failures are logged and swallowed.
    pub(crate) async fn close_target(&self) {
        debug!("Closing cached channel: {:?}", self);
        if let Err(e) = self.inner.target.close().await {
            debug!("Could not close RabbitMq channel: {:?}", e);
        }
    }
}

#[async_trait::async_trait]
impl Channel for ChannelProxy {
    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        self.inner.target.basic_ack(delivery_tag).await
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.inner.target.basic_reject(delivery_tag, requeue).await
    }

    async fn tx_select(&self) -> Result<(), anyhow::Error> {
        self.inner.target.tx_select().await?;
        self.inner.tx_selected.store(true, Ordering::Release);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), anyhow::Error> {
        self.inner.target.tx_commit().await
    }

    async fn tx_rollback(&self) -> Result<(), anyhow::Error> {
        self.inner.target.tx_rollback().await
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.returned.swap(true, Ordering::AcqRel) {
            debug!("Ignoring repeated close of channel: {:?}", self);
            return Ok(());
        }
        if !self.inner.target.is_open() {
            debug!("Discarding channel that is no longer open: {:?}", self);
            return Ok(());
        }
        match self.inner.source.upgrade() {
            Some(source) => source.release_channel(self.clone()).await,
            None => self.close_target().await,
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.target.is_open()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PartialEq for ChannelProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ChannelProxy {}

impl Hash for ChannelProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for ChannelProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProxy")
            .field("id", &Arc::as_ptr(&self.inner))
            .field("transactional", &self.inner.transactional)
            .field("generation", &self.inner.generation)
            .finish()
    }
}
