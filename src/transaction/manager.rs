//! Local RabbitMq transactions driven through a [`ResourceContext`].
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{
    create_transactional_resource_holder, IsolationLevel, Propagation, ResourceContext,
    ResourceHolder, TransactionDefinition, TransactionError,
};
use crate::connection::ConnectionFactory;

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Active,
    Committing,
    RollingBack,
    Completed,
}

/// The resources of one logical transaction.
#[derive(Debug, Default, Clone)]
pub struct TransactionObject {
    resource_holder: Option<Arc<ResourceHolder>>,
}

impl TransactionObject {
    pub fn resource_holder(&self) -> Option<&Arc<ResourceHolder>> {
        self.resource_holder.as_ref()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.resource_holder
            .as_ref()
            .map(|holder| holder.is_rollback_only())
            .unwrap_or(false)
    }
}

/// Handle returned by [`RabbitTransactionManager::begin`], to be handed back to
/// [`commit`](RabbitTransactionManager::commit) or [`rollback`](RabbitTransactionManager::rollback).
#[derive(Debug)]
pub struct TransactionStatus {
    transaction: TransactionObject,
    new_transaction: bool,
    suspended: Option<Arc<ResourceHolder>>,
    rollback_only: bool,
    state: TransactionState,
    name: Option<String>,
}

impl TransactionStatus {
    fn new(
        transaction: TransactionObject,
        new_transaction: bool,
        suspended: Option<Arc<ResourceHolder>>,
        definition: &TransactionDefinition,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            suspended,
            rollback_only: false,
            state: TransactionState::NotStarted,
            name: definition.name.clone(),
        }
    }

    pub fn transaction(&self) -> &TransactionObject {
        &self.transaction
    }

    /// Whether this scope started the transaction, as opposed to joining an existing one.
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// Whether there is an actual transaction behind this scope.
    pub fn has_transaction(&self) -> bool {
        self.transaction.resource_holder.is_some()
    }

    pub fn has_suspended_resources(&self) -> bool {
        self.suspended.is_some()
    }

    /// Only roll back when this scope completes.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_local_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Rollback-only set on the shared holder, e.g. by a participating scope.
    pub fn is_global_rollback_only(&self) -> bool {
        self.transaction.is_rollback_only()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == TransactionState::Completed
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Transaction manager for a single RabbitMq [`ConnectionFactory`].
///
/// Binds a channel from the factory to the [`ResourceContext`], allowing one bound channel per
/// factory. Code running in the same context picks the bound channel up (see
/// [`RabbitTemplate`](crate::template::RabbitTemplate)) and its acknowledgements and
/// publications become part of the transaction.
///
/// Use a [`CachingConnectionFactory`](crate::connection::CachingConnectionFactory) as target:
/// every transaction then shares the same connection while using its own channel.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use carrot_cellar::connection::CachingConnectionFactory;
/// use carrot_cellar::transaction::{RabbitTransactionManager, ResourceContext, TransactionDefinition};
///
/// async fn example(factory: CachingConnectionFactory) -> anyhow::Result<()> {
///     let manager = RabbitTransactionManager::new(Arc::new(factory));
///     let mut ctx = ResourceContext::new();
///
///     let status = manager.begin(&mut ctx, &TransactionDefinition::default()).await?;
///     // ... use the bound channel ...
///     manager.commit(&mut ctx, status).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RabbitTransactionManager {
    connection_factory: Arc<dyn ConnectionFactory>,
    default_timeout: Option<Duration>,
}

impl RabbitTransactionManager {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            connection_factory,
            default_timeout: None,
        }
    }

    /// Timeout applied to transactions whose definition does not specify one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn connection_factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connection_factory
    }

    /// Start, join or suspend a transaction according to `definition`.
    pub async fn begin(
        &self,
        ctx: &mut ResourceContext,
        definition: &TransactionDefinition,
    ) -> Result<TransactionStatus, TransactionError> {
        let mut transaction = self.do_get_transaction(ctx);

        if self.is_existing_transaction(&transaction) {
            return self.handle_existing_transaction(ctx, definition, transaction).await;
        }

        match definition.propagation {
            Propagation::Mandatory => Err(TransactionError::IllegalTransactionState(
                "No existing transaction found for transaction marked with propagation 'mandatory'",
            )),
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested => {
                self.do_begin(ctx, &mut transaction, definition).await?;
                let mut status = TransactionStatus::new(transaction, true, None, definition);
                status.state = TransactionState::Active;
                Ok(status)
            }
            Propagation::Supports | Propagation::NotSupported | Propagation::Never => {
                Ok(TransactionStatus::new(transaction, false, None, definition))
            }
        }
    }

    async fn handle_existing_transaction(
        &self,
        ctx: &mut ResourceContext,
        definition: &TransactionDefinition,
        mut transaction: TransactionObject,
    ) -> Result<TransactionStatus, TransactionError> {
        match definition.propagation {
            Propagation::Never => Err(TransactionError::IllegalTransactionState(
                "Existing transaction found for transaction marked with propagation 'never'",
            )),
            Propagation::Nested => Err(TransactionError::NestedTransactionNotSupported),
            Propagation::NotSupported => {
                debug!("Suspending current transaction");
                let suspended = self.do_suspend(ctx, &mut transaction);
                Ok(TransactionStatus::new(
                    TransactionObject::default(),
                    false,
                    suspended,
                    definition,
                ))
            }
            Propagation::RequiresNew => {
                debug!("Suspending current transaction, creating new transaction");
                let suspended = self.do_suspend(ctx, &mut transaction);
                if let Err(e) = self.do_begin(ctx, &mut transaction, definition).await {
                    if let Some(holder) = suspended {
                        self.do_resume(ctx, holder)?;
                    }
                    return Err(e);
                }
                let mut status = TransactionStatus::new(transaction, true, suspended, definition);
                status.state = TransactionState::Active;
                Ok(status)
            }
            Propagation::Required | Propagation::Supports | Propagation::Mandatory => {
                debug!("Participating in existing transaction");
                let mut status = TransactionStatus::new(transaction, false, None, definition);
                status.state = TransactionState::Active;
                Ok(status)
            }
        }
    }

    /// Commit the transaction behind `status`, or roll it back if it was marked rollback-only.
    ///
    /// Resources are released whatever the outcome.
    pub async fn commit(
        &self,
        ctx: &mut ResourceContext,
        mut status: TransactionStatus,
    ) -> Result<(), TransactionError> {
        if status.is_completed() {
            return Err(TransactionError::IllegalTransactionState(
                "Transaction is already completed - do not call commit or rollback more than once per transaction",
            ));
        }
        if status.is_local_rollback_only() {
            debug!("Transactional code has requested rollback");
            return self.process_rollback(ctx, &mut status).await;
        }
        if status.is_new_transaction() && status.is_global_rollback_only() {
            debug!("Global transaction is marked as rollback-only but transactional code requested commit");
            self.process_rollback(ctx, &mut status).await?;
            return Err(TransactionError::UnexpectedRollback);
        }
        self.process_commit(ctx, &mut status).await
    }

    /// Roll back the transaction behind `status`.
    ///
    /// A participating scope only marks the shared transaction as rollback-only.
    pub async fn rollback(
        &self,
        ctx: &mut ResourceContext,
        mut status: TransactionStatus,
    ) -> Result<(), TransactionError> {
        if status.is_completed() {
            return Err(TransactionError::IllegalTransactionState(
                "Transaction is already completed - do not call commit or rollback more than once per transaction",
            ));
        }
        self.process_rollback(ctx, &mut status).await
    }

    async fn process_commit(
        &self,
        ctx: &mut ResourceContext,
        status: &mut TransactionStatus,
    ) -> Result<(), TransactionError> {
        status.state = TransactionState::Committing;
        let outcome = if status.is_new_transaction() {
            debug!("Initiating transaction commit");
            self.do_commit(status).await
        } else {
            Ok(())
        };
        let cleanup = self.cleanup_after_completion(ctx, status).await;
        outcome.and(cleanup)
    }

    async fn process_rollback(
        &self,
        ctx: &mut ResourceContext,
        status: &mut TransactionStatus,
    ) -> Result<(), TransactionError> {
        status.state = TransactionState::RollingBack;
        let outcome = if status.is_new_transaction() {
            debug!("Initiating transaction rollback");
            self.do_rollback(status).await
        } else if status.has_transaction() {
            debug!("Participating transaction failed - marking existing transaction as rollback-only");
            self.do_set_rollback_only(status);
            Ok(())
        } else {
            Ok(())
        };
        let cleanup = self.cleanup_after_completion(ctx, status).await;
        outcome.and(cleanup)
    }

    async fn cleanup_after_completion(
        &self,
        ctx: &mut ResourceContext,
        status: &mut TransactionStatus,
    ) -> Result<(), TransactionError> {
        status.state = TransactionState::Completed;
        if status.is_new_transaction() {
            self.do_cleanup_after_completion(ctx, &status.transaction).await;
        }
        if let Some(suspended) = status.suspended.take() {
            debug!("Resuming suspended transaction after completion of inner transaction");
            self.do_resume(ctx, suspended)?;
        }
        Ok(())
    }

    /// The transaction currently bound in `ctx`, if any.
    pub fn do_get_transaction(&self, ctx: &ResourceContext) -> TransactionObject {
        TransactionObject {
            resource_holder: ctx.get_resource(self.connection_factory.id()),
        }
    }

    pub fn is_existing_transaction(&self, transaction: &TransactionObject) -> bool {
        transaction.resource_holder.is_some()
    }

    /// Obtain a transactional channel, start its deadline and bind it to `ctx`.
    pub async fn do_begin(
        &self,
        ctx: &mut ResourceContext,
        transaction: &mut TransactionObject,
        definition: &TransactionDefinition,
    ) -> Result<(), TransactionError> {
        if definition.isolation != IsolationLevel::Default {
            return Err(TransactionError::InvalidIsolationLevel);
        }
        let holder = create_transactional_resource_holder(self.connection_factory.as_ref())
            .await
            .map_err(|e| TransactionError::CannotCreateTransaction(Box::new(e)))?;
        debug!("Created AMQP transaction on channel {:?}", holder.channel());
        holder.set_synchronized_with_transaction(true);
        if let Some(timeout) = definition.timeout.or(self.default_timeout) {
            holder.set_timeout(timeout);
        }
        if let Err(e) = ctx.bind_resource(self.connection_factory.id(), Arc::clone(&holder)) {
            holder.close_all(None).await;
            return Err(TransactionError::CannotCreateTransaction(Box::new(e)));
        }
        transaction.resource_holder = Some(holder);
        Ok(())
    }

    /// Unbind the current holder, leaving its content untouched.
    pub fn do_suspend(
        &self,
        ctx: &mut ResourceContext,
        transaction: &mut TransactionObject,
    ) -> Option<Arc<ResourceHolder>> {
        transaction.resource_holder = None;
        ctx.unbind_resource_if_possible(self.connection_factory.id())
    }

    pub fn do_resume(
        &self,
        ctx: &mut ResourceContext,
        suspended: Arc<ResourceHolder>,
    ) -> Result<(), TransactionError> {
        ctx.bind_resource(self.connection_factory.id(), suspended)
    }

    pub async fn do_commit(&self, status: &TransactionStatus) -> Result<(), TransactionError> {
        match status.transaction.resource_holder() {
            Some(holder) => holder.commit_all().await,
            None => Ok(()),
        }
    }

    pub async fn do_rollback(&self, status: &TransactionStatus) -> Result<(), TransactionError> {
        match status.transaction.resource_holder() {
            Some(holder) => holder.rollback_all().await,
            None => Ok(()),
        }
    }

    pub fn do_set_rollback_only(&self, status: &TransactionStatus) {
        if let Some(holder) = status.transaction.resource_holder() {
            holder.set_rollback_only(true);
        }
    }

    /// Unbind and release the transaction's resources. Runs whatever the outcome of the
    /// commit or rollback.
    pub async fn do_cleanup_after_completion(
        &self,
        ctx: &mut ResourceContext,
        transaction: &TransactionObject,
    ) {
        let factory = self.connection_factory.id();
        ctx.unbind_resource_if_possible(factory);
        if let Some(holder) = transaction.resource_holder() {
            holder.close_all(ctx.consumer_channel(factory)).await;
            holder.clear();
        }
    }
}
