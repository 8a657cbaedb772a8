//! Connection and channel sharing on top of a pluggable AMQP client.
//!
//! The physical resources are abstracted behind three traits:
//! - [`Connector`] opens physical [`Connection`]s;
//! - [`Connection`] opens physical [`Channel`]s;
//! - [`Channel`] exposes the acknowledgement and transaction surface we need.
//!
//! [`lapin`] implementations live in [`crate::amqp`].
//!
//! Two [`ConnectionFactory`] flavours are provided:
//! - [`CachingConnectionFactory`] shares one connection and caches channels;
//! - [`SingleConnectionFactory`] shares one connection and never caches channels.
//!
//! Both hand out [`ConnectionProxy`]s and [`ChannelProxy`]s which intercept `close`.
use std::any::Any;
use std::fmt;

mod caching;
mod error;
mod listener;
mod proxy;
mod single;

pub use caching::{CachingConnectionFactory, CachingConnectionFactoryBuilder, CachingSettings};
pub use error::ConnectionError;
pub use listener::{CompositeConnectionListener, ConnectionListener};
pub use proxy::{ChannelProxy, ConnectionProxy};
pub use single::SingleConnectionFactory;

/// A broker-assigned sequence number identifying a delivered message, scoped to one channel.
pub type DeliveryTag = u64;

/// A physical AMQP channel.
///
/// Implementations are expected to be cheap to share behind an `Arc`.
/// Channels are not thread-safe by AMQP convention: concurrent use of the same channel
/// from two tasks is a caller error.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Acknowledge a single delivery (`multiple = false`).
    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    /// Reject a single delivery.
    async fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), anyhow::Error>;

    /// Start a broker-side transaction on this channel.
    async fn tx_select(&self) -> Result<(), anyhow::Error>;

    async fn tx_commit(&self) -> Result<(), anyhow::Error>;

    async fn tx_rollback(&self) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;

    fn is_open(&self) -> bool;

    /// Access the concrete client type (e.g. `lapin::Channel`) to perform operations
    /// outside of this trait's surface.
    fn as_any(&self) -> &dyn Any;
}

/// A physical connection to a broker.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Box<dyn Channel>, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;

    fn is_open(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Opens physical [`Connection`]s to a broker.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>, anyhow::Error>;

    /// Human readable description of the target, used in logs.
    fn describe(&self) -> String;
}

/// Identity of a connection factory.
///
/// Resources are bound to a [`ResourceContext`](crate::transaction::ResourceContext) by
/// factory identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FactoryId(uuid::Uuid);

impl FactoryId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out shared connections to a broker.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Return the shared connection, opening a new physical connection if there is none
    /// or if the current one is no longer open.
    async fn create_connection(&self) -> Result<ConnectionProxy, ConnectionError>;

    fn id(&self) -> FactoryId;
}
