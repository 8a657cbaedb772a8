//! Run channel callbacks, joining the transaction bound to the current context if any.
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::connection::{Channel, ChannelProxy, ConnectionFactory, DeliveryTag};
use crate::transaction::{
    get_transactional_resource_holder, release_connection, release_resources, ResourceContext,
    ResourceHolder, TransactionError,
};

/// Error returned by [`RabbitTemplate`].
#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("Failed to obtain or release RabbitMq resources")]
    Resource(#[from] TransactionError),
    #[error("The channel callback failed")]
    Action(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while running the channel callback")]
    Timeout,
}

impl From<crate::connection::ConnectionError> for TemplateError {
    fn from(e: crate::connection::ConnectionError) -> Self {
        Self::Resource(e.into())
    }
}

/// Runs callbacks against a channel obtained from a [`ConnectionFactory`].
///
/// The channel is chosen as follows:
/// - if a [`ResourceHolder`] is bound for the factory in the [`ResourceContext`], its channel is
///   used and left open: the surrounding transaction commits or rolls it back;
/// - otherwise, if the template is `channel_transacted`, a transactional channel is used for
///   the duration of the callback and committed on success, rolled back on failure;
/// - otherwise a plain channel is borrowed and closed (i.e. returned to the cache) afterwards.
///
/// # How do I build a `RabbitTemplate`?
///
/// The starting point is [`RabbitTemplate::builder`].
#[derive(Clone)]
pub struct RabbitTemplate {
    connection_factory: Arc<dyn ConnectionFactory>,
    channel_transacted: bool,
    /// Upper bound on the duration of a callback.
    timeout: Duration,
}

impl RabbitTemplate {
    pub fn builder(connection_factory: Arc<dyn ConnectionFactory>) -> RabbitTemplateBuilder {
        RabbitTemplateBuilder::new(connection_factory)
    }

    pub fn is_channel_transacted(&self) -> bool {
        self.channel_transacted
    }

    /// Run `action` against a channel.
    ///
    /// ```rust
    /// use carrot_cellar::connection::Channel;
    /// use carrot_cellar::template::{RabbitTemplate, TemplateError};
    /// use carrot_cellar::transaction::ResourceContext;
    ///
    /// async fn ack(template: &RabbitTemplate, ctx: &mut ResourceContext) -> Result<(), TemplateError> {
    ///     template
    ///         .execute(ctx, |channel| Box::pin(async move { channel.basic_ack(1).await }))
    ///         .await
    /// }
    /// ```
    pub async fn execute<T, F>(&self, ctx: &mut ResourceContext, action: F) -> Result<T, TemplateError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c ChannelProxy) -> BoxFuture<'c, Result<T, anyhow::Error>> + Send,
    {
        if let Some(holder) = ctx.get_resource(self.connection_factory.id()) {
            if let Some(channel) = holder.channel() {
                debug!("Executing callback on transactional channel {:?}", channel);
                let timeout = self.timeout_within(&holder)?;
                return self.invoke(&channel, timeout, action).await;
            }
        }

        if self.channel_transacted {
            let holder =
                get_transactional_resource_holder(ctx, self.connection_factory.as_ref(), false)
                    .await?;
            return self.execute_locally_transacted(&holder, action).await;
        }

        let connection = self.connection_factory.create_connection().await?;
        let channel = connection.create_channel(false).await?;
        let outcome = self.invoke(&channel, self.timeout, action).await;
        if let Err(e) = channel.close().await {
            debug!("Could not close RabbitMq channel: {:?}", e);
        }
        release_connection(&connection).await;
        outcome
    }

    async fn execute_locally_transacted<T, F>(
        &self,
        holder: &ResourceHolder,
        action: F,
    ) -> Result<T, TemplateError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c ChannelProxy) -> BoxFuture<'c, Result<T, anyhow::Error>> + Send,
    {
        let Some(channel) = holder.channel() else {
            release_resources(holder, None).await;
            return Err(TransactionError::IllegalTransactionState(
                "No channel available in the transactional resource holder",
            )
            .into());
        };
        let outcome = self.invoke(&channel, self.timeout, action).await;
        let completion = match &outcome {
            Ok(_) => holder.commit_all().await,
            Err(_) => holder.rollback_all().await,
        };
        release_resources(holder, None).await;
        let value = outcome?;
        completion?;
        Ok(value)
    }

    /// Acknowledge a delivery received on `channel`.
    ///
    /// If `channel` takes part in the transaction bound in `ctx`, the acknowledgement is
    /// deferred until that transaction commits.
    pub async fn acknowledge(
        &self,
        ctx: &ResourceContext,
        channel: &ChannelProxy,
        delivery_tag: DeliveryTag,
    ) -> Result<(), TemplateError> {
        match ctx.get_resource(self.connection_factory.id()) {
            Some(holder) if holder.contains_channel(channel) => {
                holder.add_delivery_tag(channel, delivery_tag);
                Ok(())
            }
            _ => channel
                .basic_ack(delivery_tag)
                .await
                .map_err(TemplateError::Action),
        }
    }

    /// The callback timeout, capped by the time left in the bound transaction.
    fn timeout_within(&self, holder: &ResourceHolder) -> Result<Duration, TemplateError> {
        Ok(match holder.time_to_live()? {
            Some(time_to_live) => time_to_live.min(self.timeout),
            None => self.timeout,
        })
    }

    async fn invoke<T, F>(
        &self,
        channel: &ChannelProxy,
        timeout: Duration,
        action: F,
    ) -> Result<T, TemplateError>
    where
        F: for<'c> FnOnce(&'c ChannelProxy) -> BoxFuture<'c, Result<T, anyhow::Error>>,
    {
        tokio::time::timeout(timeout, action(channel))
            .await
            .map_err(|_| TemplateError::Timeout)?
            .map_err(TemplateError::Action)
    }
}

/// A builder for [`RabbitTemplate`].
///
/// Use [`RabbitTemplate::builder`] as entrypoint.
pub struct RabbitTemplateBuilder {
    connection_factory: Arc<dyn ConnectionFactory>,
    channel_transacted: bool,
    timeout: Duration,
}

impl RabbitTemplateBuilder {
    fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            connection_factory,
            channel_transacted: false,
            timeout: Duration::from_secs(3),
        }
    }

    /// Run callbacks outside of a bound transaction on a transactional channel, committed
    /// when the callback succeeds.
    #[must_use]
    pub fn channel_transacted(mut self, channel_transacted: bool) -> Self {
        self.channel_transacted = channel_transacted;
        self
    }

    /// Timeout applied to each callback.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> RabbitTemplate {
        RabbitTemplate {
            connection_factory: self.connection_factory,
            channel_transacted: self.channel_transacted,
            timeout: self.timeout,
        }
    }
}
