//! Explicit execution context carrying the resources bound to the current unit of work.
use std::collections::HashMap;
use std::sync::Arc;

use super::{ResourceHolder, TransactionError};
use crate::connection::{ChannelProxy, FactoryId};

/// Maps connection factories to the [`ResourceHolder`] bound for the current unit of work.
///
/// A context is owned by one logical flow of execution (a task handling a message, a request
/// handler, ...) and passed down by reference, so that nested code obtains the channel already
/// taking part in the transaction instead of opening a new one.
///
/// The context also remembers, per factory, the channel used by the consumer running in this
/// flow: that channel is never closed when the transaction's resources are released.
#[derive(Default, Debug)]
pub struct ResourceContext {
    resources: HashMap<FactoryId, Arc<ResourceHolder>>,
    consumer_channels: HashMap<FactoryId, ChannelProxy>,
}

impl ResourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `holder` to `factory`.
    ///
    /// Fails if a holder is already bound for the same factory: a context takes part in at
    /// most one transaction per factory at a time.
    pub fn bind_resource(
        &mut self,
        factory: FactoryId,
        holder: Arc<ResourceHolder>,
    ) -> Result<(), TransactionError> {
        if self.resources.contains_key(&factory) {
            return Err(TransactionError::AlreadyBound(factory));
        }
        self.resources.insert(factory, holder);
        Ok(())
    }

    pub fn get_resource(&self, factory: FactoryId) -> Option<Arc<ResourceHolder>> {
        self.resources.get(&factory).cloned()
    }

    pub fn has_resource(&self, factory: FactoryId) -> bool {
        self.resources.contains_key(&factory)
    }

    /// Unbind the holder for `factory`, failing if there is none.
    pub fn unbind_resource(
        &mut self,
        factory: FactoryId,
    ) -> Result<Arc<ResourceHolder>, TransactionError> {
        self.unbind_resource_if_possible(factory)
            .ok_or(TransactionError::NotBound(factory))
    }

    pub fn unbind_resource_if_possible(&mut self, factory: FactoryId) -> Option<Arc<ResourceHolder>> {
        self.resources.remove(&factory)
    }

    /// Mark `channel` as the channel of the consumer running in this context.
    pub fn register_consumer_channel(&mut self, factory: FactoryId, channel: ChannelProxy) {
        self.consumer_channels.insert(factory, channel);
    }

    pub fn unregister_consumer_channel(&mut self, factory: FactoryId) -> Option<ChannelProxy> {
        self.consumer_channels.remove(&factory)
    }

    pub fn consumer_channel(&self, factory: FactoryId) -> Option<&ChannelProxy> {
        self.consumer_channels.get(&factory)
    }
}
