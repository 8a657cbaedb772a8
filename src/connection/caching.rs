//! A connection factory sharing one physical connection and caching channels.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info};

use super::proxy::ChannelSource;
use super::{
    ChannelProxy, CompositeConnectionListener, ConnectionError, ConnectionFactory,
    ConnectionListener, ConnectionProxy, Connector, FactoryId,
};
use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::LapinConnector;

/// Channel cache configuration for a [`CachingConnectionFactory`].
#[derive(Debug, Deserialize, Clone)]
pub struct CachingSettings {
    /// How many idle channels are kept around, per cache.
    ///
    /// Transactional and non-transactional channels are cached separately:
    /// each cache holds at most `channel_cache_size` channels.
    #[serde(default = "default_channel_cache_size")]
    pub channel_cache_size: usize,
}

fn default_channel_cache_size() -> usize {
    1
}

impl Default for CachingSettings {
    fn default() -> Self {
        Self {
            channel_cache_size: default_channel_cache_size(),
        }
    }
}

/// A [`ConnectionFactory`] that shares a single physical connection between all its users
/// and keeps a bounded cache of channels.
///
/// # Channel caching
///
/// Closing a [`ChannelProxy`] obtained from this factory does not close the physical channel:
/// it is appended to the tail of the cache matching its mode (transactional or not), unless
/// that cache is already full, in which case the channel is physically closed.
/// Channels are handed out from the head of the cache, so the channel that has been idle the
/// longest is reused first.
///
/// Transactional and non-transactional channels never mix: asking for a transactional channel
/// when only non-transactional channels are cached opens a new physical channel.
///
/// # Fault tolerance
///
/// A broken connection is detected on the next [`ConnectionFactory::create_connection`] and
/// replaced. Channels belonging to a replaced or disposed connection are closed physically
/// when returned, never cached.
///
/// # Example
///
/// ```rust
/// use carrot_cellar::amqp::configuration::RabbitMqSettings;
/// use carrot_cellar::connection::{CachingConnectionFactory, ConnectionFactory};
///
/// async fn example() -> anyhow::Result<()> {
///     let settings = RabbitMqSettings::default();
///     let factory = CachingConnectionFactory::new_from_config(&settings)?;
///
///     let connection = factory.create_connection().await?;
///     let channel = connection.create_channel(false).await?;
///     // ... use the channel ...
///     carrot_cellar::connection::Channel::close(&channel).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CachingConnectionFactory {
    shared: Arc<Shared>,
}

struct Shared {
    id: FactoryId,
    me: Weak<Shared>,
    connector: Box<dyn Connector>,
    listeners: RwLock<CompositeConnectionListener>,
    /// Serialises physical (re)connections.
    init_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<ConnectionProxy>>,
    caches: Mutex<ChannelCaches>,
    channel_cache_size: AtomicUsize,
    /// Bumped every time the shared connection is replaced or disposed.
    generation: AtomicU64,
}

#[derive(Default)]
struct ChannelCaches {
    transactional: VecDeque<ChannelProxy>,
    non_transactional: VecDeque<ChannelProxy>,
}

impl ChannelCaches {
    fn for_mode(&mut self, transactional: bool) -> &mut VecDeque<ChannelProxy> {
        if transactional {
            &mut self.transactional
        } else {
            &mut self.non_transactional
        }
    }

    fn drain(&mut self) -> Vec<ChannelProxy> {
        self.non_transactional
            .drain(..)
            .chain(self.transactional.drain(..))
            .collect()
    }
}

impl CachingConnectionFactory {
    /// Start building a [`CachingConnectionFactory`] on top of a [`Connector`].
    pub fn builder(connector: impl Connector) -> CachingConnectionFactoryBuilder {
        CachingConnectionFactoryBuilder::new(Box::new(connector))
    }

    /// Create a factory connecting with [`lapin`], sized by the cache settings embedded in
    /// `settings`.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let connector = LapinConnector::new_from_config(settings)?;
        Ok(Self::builder(connector).settings(&settings.caching).build()?)
    }

    pub fn channel_cache_size(&self) -> usize {
        self.shared.channel_cache_size.load(Ordering::Acquire)
    }

    /// Change the size of each channel cache.
    ///
    /// Shrinking the cache does not evict channels that are already cached: the caches
    /// converge to the new size as channels are borrowed and returned.
    pub fn set_channel_cache_size(&self, size: usize) -> Result<(), ConnectionError> {
        validate_cache_size(size)?;
        self.shared.channel_cache_size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.listeners.write().add(listener);
    }

    /// Replace all connection listeners.
    pub fn set_connection_listeners(&self, listeners: Vec<Arc<dyn ConnectionListener>>) {
        *self.shared.listeners.write() = CompositeConnectionListener::new(listeners);
    }

    /// The number of idle channels currently cached for the given mode.
    pub fn cached_channel_count(&self, transactional: bool) -> usize {
        self.shared.caches.lock().for_mode(transactional).len()
    }

    /// Close every cached channel and the shared connection.
    ///
    /// The factory remains usable: the next call to
    /// [`create_connection`](ConnectionFactory::create_connection) opens a fresh connection
    /// with empty caches.
    pub async fn dispose(&self) {
        let _guard = self.shared.init_lock.lock().await;
        let connection = self.shared.connection.lock().take();
        self.shared.retire(connection).await;
    }

    /// Alias of [`dispose`](Self::dispose).
    pub async fn reset_connection(&self) {
        self.dispose().await;
    }
}

impl Shared {
    /// The current shared connection, if it is still open.
    fn open_connection(&self) -> Option<ConnectionProxy> {
        self.connection
            .lock()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Invalidate the current generation: physically close cached channels, then the connection.
    async fn retire(&self, connection: Option<ConnectionProxy>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let cached = self.caches.lock().drain();
        for channel in cached {
            channel.close_target().await;
        }
        if let Some(connection) = connection {
            connection.close_target().await;
            self.listeners.read().on_close(&connection);
        }
    }

    fn as_source(&self) -> Weak<dyn ChannelSource> {
        self.me.clone()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for CachingConnectionFactory {
    #[tracing::instrument(name = "caching_create_connection", skip(self))]
    async fn create_connection(&self) -> Result<ConnectionProxy, ConnectionError> {
        let shared = &self.shared;
        if let Some(connection) = shared.open_connection() {
            return Ok(connection);
        }

        let _guard = shared.init_lock.lock().await;
        // Another task may have connected while we were waiting for the lock.
        if let Some(connection) = shared.open_connection() {
            return Ok(connection);
        }

        let stale = shared.connection.lock().take();
        if stale.is_some() {
            info!("Shared RabbitMq connection is no longer open, replacing it");
            shared.retire(stale).await;
        }

        let target = shared
            .connector
            .connect()
            .await
            .map_err(|source| ConnectionError::Connect {
                target: shared.connector.describe(),
                source,
            })?;
        let generation = shared.generation.load(Ordering::Acquire);
        let connection = ConnectionProxy::new(
            Arc::from(target),
            shared.as_source(),
            generation,
            shared.connector.describe(),
        );
        info!("Established shared RabbitMq connection: {:?}", connection);
        *shared.connection.lock() = Some(connection.clone());
        shared.listeners.read().on_create(&connection);
        Ok(connection)
    }

    fn id(&self) -> FactoryId {
        self.shared.id
    }
}

#[async_trait::async_trait]
impl ChannelSource for Shared {
    async fn open_channel(
        &self,
        connection: &ConnectionProxy,
        transactional: bool,
    ) -> Result<ChannelProxy, ConnectionError> {
        loop {
            let cached = self.caches.lock().for_mode(transactional).pop_front();
            match cached {
                Some(channel) if channel.target_channel().is_open() => {
                    debug!("Found cached RabbitMq channel: {:?}", channel);
                    return Ok(channel.reborrow());
                }
                Some(channel) => {
                    debug!("Discarding cached channel that is no longer open: {:?}", channel);
                }
                None => break,
            }
        }

        let target = connection
            .target_connection()
            .create_channel()
            .await
            .map_err(ConnectionError::CreateChannel)?;
        if transactional {
            target
                .tx_select()
                .await
                .map_err(ConnectionError::CreateChannel)?;
        }
        let channel = ChannelProxy::new(
            Arc::from(target),
            self.as_source(),
            transactional,
            connection.generation(),
        );
        debug!("Creating cached RabbitMq channel: {:?}", channel);
        Ok(channel)
    }

    async fn release_channel(&self, channel: ChannelProxy) {
        let cached = {
            let mut caches = self.caches.lock();
            let cache = caches.for_mode(channel.is_transactional());
            if channel.generation() != self.generation.load(Ordering::Acquire) {
                false
            } else if channel.is_tx_selected() && !channel.is_transactional() {
                // `tx.select` cannot be undone: keep it out of the non-transactional cache.
                false
            } else if cache.contains(&channel) {
                true
            } else if cache.len() < self.channel_cache_size.load(Ordering::Acquire) {
                cache.push_back(channel.clone());
                true
            } else {
                false
            }
        };
        if cached {
            debug!("Returned channel to the cache: {:?}", channel);
        } else {
            channel.close_target().await;
        }
    }
}

fn validate_cache_size(size: usize) -> Result<(), ConnectionError> {
    if size == 0 {
        return Err(ConnectionError::Configuration(
            "The channel cache size must be at least 1".into(),
        ));
    }
    Ok(())
}

/// A builder for [`CachingConnectionFactory`].
///
/// Use [`CachingConnectionFactory::builder`] as entrypoint.
pub struct CachingConnectionFactoryBuilder {
    connector: Box<dyn Connector>,
    channel_cache_size: usize,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl CachingConnectionFactoryBuilder {
    fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            channel_cache_size: default_channel_cache_size(),
            listeners: vec![],
        }
    }

    /// The number of idle channels kept in each cache.
    /// Defaults to 1 if left unspecified.
    #[must_use]
    pub fn channel_cache_size(mut self, size: usize) -> Self {
        self.channel_cache_size = size;
        self
    }

    /// Apply [`CachingSettings`].
    #[must_use]
    pub fn settings(self, settings: &CachingSettings) -> Self {
        self.channel_cache_size(settings.channel_cache_size)
    }

    /// Register a listener notified when the physical connection is created or closed.
    #[must_use]
    pub fn with_listener<L: ConnectionListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Finalise the builder and get an instance of [`CachingConnectionFactory`].
    pub fn build(self) -> Result<CachingConnectionFactory, ConnectionError> {
        validate_cache_size(self.channel_cache_size)?;
        let shared = Arc::new_cyclic(|me| Shared {
            id: FactoryId::new(),
            me: me.clone(),
            connector: self.connector,
            listeners: RwLock::new(CompositeConnectionListener::new(self.listeners)),
            init_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            caches: Mutex::new(ChannelCaches::default()),
            channel_cache_size: AtomicUsize::new(self.channel_cache_size),
            generation: AtomicU64::new(0),
        });
        Ok(CachingConnectionFactory { shared })
    }
}
