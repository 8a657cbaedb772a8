//! Obtaining and releasing transactional resources.
use std::sync::Arc;

use tracing::debug;

use super::{ResourceContext, ResourceHolder, TransactionError};
use crate::connection::{ChannelProxy, ConnectionFactory, ConnectionProxy};

/// Return the holder bound to `factory` in `ctx`, or create a new one holding a fresh
/// connection and transactional channel.
///
/// With `synchronize`, a newly created holder is marked as synchronized with the transaction
/// and bound to `ctx`, so that later calls in the same context reuse it.
pub async fn get_transactional_resource_holder(
    ctx: &mut ResourceContext,
    factory: &dyn ConnectionFactory,
    synchronize: bool,
) -> Result<Arc<ResourceHolder>, TransactionError> {
    if let Some(holder) = ctx.get_resource(factory.id()) {
        return Ok(holder);
    }
    let holder = create_transactional_resource_holder(factory).await?;
    if synchronize {
        holder.set_synchronized_with_transaction(true);
        ctx.bind_resource(factory.id(), Arc::clone(&holder))?;
    }
    Ok(holder)
}

/// Create an unbound holder with a connection and a transactional channel from `factory`.
pub async fn create_transactional_resource_holder(
    factory: &dyn ConnectionFactory,
) -> Result<Arc<ResourceHolder>, TransactionError> {
    let connection = factory.create_connection().await?;
    let channel = match connection.create_channel(true).await {
        Ok(channel) => channel,
        Err(e) => {
            release_connection(&connection).await;
            return Err(e.into());
        }
    };
    let holder = ResourceHolder::new();
    holder.add_connection(connection.clone())?;
    holder.add_channel(channel, Some(&connection))?;
    Ok(Arc::new(holder))
}

/// Close all channels and release all connections of `holder`.
pub async fn release_resources(holder: &ResourceHolder, consumer_channel: Option<&ChannelProxy>) {
    holder.close_all(consumer_channel).await;
}

/// Give a connection back to its factory. Failures are logged, never surfaced.
pub async fn release_connection(connection: &ConnectionProxy) {
    if let Err(e) = connection.close().await {
        debug!("Could not close RabbitMq connection: {:?}", e);
    }
}

/// Whether `channel` takes part in the transaction bound to `factory` in `ctx`.
pub fn is_channel_transactional(
    ctx: &ResourceContext,
    channel: &ChannelProxy,
    factory: &dyn ConnectionFactory,
) -> bool {
    ctx.get_resource(factory.id())
        .map(|holder| holder.contains_channel(channel))
        .unwrap_or(false)
}
