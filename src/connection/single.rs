//! A connection factory sharing one physical connection, without channel caching.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::info;

use super::proxy::ChannelSource;
use super::{
    ChannelProxy, CompositeConnectionListener, ConnectionError, ConnectionFactory,
    ConnectionListener, ConnectionProxy, Connector, FactoryId,
};

/// A [`ConnectionFactory`] that returns the same connection on every call.
///
/// Closing the connection proxy is a no-op: the physical connection is closed by
/// [`reset_connection`](Self::reset_connection) or [`dispose`](Self::dispose) only.
/// Channels are not cached: each request opens a physical channel and closing the
/// channel proxy closes it.
#[derive(Clone)]
pub struct SingleConnectionFactory {
    shared: Arc<Shared>,
}

struct Shared {
    id: FactoryId,
    me: Weak<Shared>,
    connector: Box<dyn Connector>,
    listeners: RwLock<CompositeConnectionListener>,
    connection: tokio::sync::Mutex<Option<ConnectionProxy>>,
    generation: AtomicU64,
}

impl SingleConnectionFactory {
    pub fn new(connector: impl Connector) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            id: FactoryId::new(),
            me: me.clone(),
            connector: Box::new(connector),
            listeners: RwLock::new(CompositeConnectionListener::default()),
            connection: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        Self { shared }
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.listeners.write().add(listener);
    }

    /// Eagerly (re)initialise the shared connection, closing the previous one if any.
    pub async fn init_connection(&self) -> Result<ConnectionProxy, ConnectionError> {
        let mut current = self.shared.connection.lock().await;
        self.shared.connect(&mut current).await
    }

    /// Close the shared connection. The next
    /// [`create_connection`](ConnectionFactory::create_connection) reconnects.
    pub async fn reset_connection(&self) {
        let mut current = self.shared.connection.lock().await;
        if let Some(connection) = current.take() {
            self.shared.close(&connection).await;
        }
    }

    /// Alias of [`reset_connection`](Self::reset_connection).
    pub async fn dispose(&self) {
        self.reset_connection().await;
    }
}

impl Shared {
    async fn connect(
        &self,
        current: &mut Option<ConnectionProxy>,
    ) -> Result<ConnectionProxy, ConnectionError> {
        if let Some(previous) = current.take() {
            self.close(&previous).await;
        }
        let target = self
            .connector
            .connect()
            .await
            .map_err(|source| ConnectionError::Connect {
                target: self.connector.describe(),
                source,
            })?;
        let source: Weak<dyn ChannelSource> = self.me.clone();
        let connection = ConnectionProxy::new(
            Arc::from(target),
            source,
            self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            self.connector.describe(),
        );
        info!("Established shared RabbitMq connection: {:?}", connection);
        *current = Some(connection.clone());
        self.listeners.read().on_create(&connection);
        Ok(connection)
    }

    async fn close(&self, connection: &ConnectionProxy) {
        connection.close_target().await;
        self.listeners.read().on_close(connection);
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for SingleConnectionFactory {
    async fn create_connection(&self) -> Result<ConnectionProxy, ConnectionError> {
        let mut current = self.shared.connection.lock().await;
        if let Some(connection) = current.clone().filter(|c| c.is_open()) {
            return Ok(connection);
        }
        self.shared.connect(&mut current).await
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
        Ok(ChannelProxy::new(
            Arc::from(target),
            self.me.clone(),
            transactional,
            connection.generation(),
        ))
    }

    async fn release_channel(&self, channel: ChannelProxy) {
        channel.close_target().await;
    }
}
