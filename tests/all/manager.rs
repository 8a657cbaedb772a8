use std::sync::Arc;

use carrot_cellar::connection::{CachingConnectionFactory, ConnectionFactory};
use carrot_cellar::transaction::{
    IsolationLevel, Propagation, RabbitTransactionManager, ResourceContext,
    TransactionDefinition, TransactionError, TransactionState,
};

use crate::helpers::{channel_id, get_caching_factory, Operation, Recorder};

fn get_manager() -> (RabbitTransactionManager, CachingConnectionFactory, Arc<Recorder>) {
    let (factory, recorder) = get_caching_factory(1);
    let manager = RabbitTransactionManager::new(Arc::new(factory.clone()));
    (manager, factory, recorder)
}

fn required() -> TransactionDefinition {
    TransactionDefinition::default()
}

#[tokio::test]
async fn a_new_transaction_binds_a_transactional_channel_to_the_context() {
    // Arrange
    let (manager, factory, _recorder) = get_manager();
    let mut ctx = ResourceContext::new();

    // Act
    let status = manager.begin(&mut ctx, &required()).await.unwrap();

    // Assert
    assert!(status.is_new_transaction());
    assert_eq!(TransactionState::Active, status.state());
    let holder = ctx.get_resource(factory.id()).unwrap();
    assert!(holder.is_synchronized_with_transaction());
    assert!(holder.channel().unwrap().is_tx_selected());
    assert!(Arc::ptr_eq(&holder, status.transaction().resource_holder().unwrap()));
}

#[tokio::test]
async fn commit_acknowledges_deliveries_and_releases_the_channel() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let status = manager.begin(&mut ctx, &required()).await.unwrap();
    let holder = ctx.get_resource(factory.id()).unwrap();
    let channel = holder.channel().unwrap();
    holder.add_delivery_tag(&channel, 1);

    // Act
    manager.commit(&mut ctx, status).await.unwrap();

    // Assert
    let id = channel_id(&channel);
    assert_eq!(
        vec![
            Operation::Ack { channel: id, delivery_tag: 1 },
            Operation::TxCommit { channel: id },
        ],
        recorder.channel_operations(id)[2..].to_vec()
    );
    assert!(!ctx.has_resource(factory.id()));
    assert!(!holder.is_synchronized_with_transaction());
    assert_eq!(1, factory.cached_channel_count(true));
}

#[tokio::test]
async fn rollback_rejects_deliveries_and_releases_the_channel() {
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let status = manager.begin(&mut ctx, &required()).await.unwrap();
    let channel = ctx.get_resource(factory.id()).unwrap().channel().unwrap();
    ctx.get_resource(factory.id())
        .unwrap()
        .add_delivery_tag(&channel, 5);

    manager.rollback(&mut ctx, status).await.unwrap();

    let id = channel_id(&channel);
    assert_eq!(
        vec![
            Operation::TxRollback { channel: id },
            Operation::Reject { channel: id, delivery_tag: 5, requeue: true },
            Operation::TxCommit { channel: id },
        ],
        recorder.channel_operations(id)[2..].to_vec()
    );
    assert!(!ctx.has_resource(factory.id()));
}

#[tokio::test]
async fn a_failed_commit_still_unbinds_and_releases_the_channel() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let status = manager.begin(&mut ctx, &required()).await.unwrap();
    let holder = ctx.get_resource(factory.id()).unwrap();
    let channel = holder.channel().unwrap();
    holder.add_delivery_tag(&channel, 1);
    recorder.fail_commits(true);

    // Act
    let err = manager.commit(&mut ctx, status).await.unwrap_err();

    // Assert
    assert!(matches!(err, TransactionError::Amqp { .. }));
    assert!(!ctx.has_resource(factory.id()));
    assert!(holder.channels().is_empty());
    assert_eq!(1, factory.cached_channel_count(true));
    assert_eq!(0, recorder.count(|op| matches!(op, Operation::TxCommit { .. })));
}

#[tokio::test]
async fn a_local_rollback_request_turns_commit_into_rollback() {
    let (manager, _factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let mut status = manager.begin(&mut ctx, &required()).await.unwrap();

    status.set_rollback_only();
    manager.commit(&mut ctx, status).await.unwrap();

    assert_eq!(1, recorder.count(|op| matches!(op, Operation::TxRollback { .. })));
    assert_eq!(0, recorder.count(|op| matches!(op, Operation::TxCommit { .. })));
}

#[tokio::test]
async fn a_participating_scope_joins_the_existing_transaction() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let outer = manager.begin(&mut ctx, &required()).await.unwrap();

    // Act
    let inner = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::Mandatory))
        .await
        .unwrap();
    manager.commit(&mut ctx, inner).await.unwrap();

    // Assert
    assert_eq!(0, recorder.count(|op| matches!(op, Operation::TxCommit { .. })));
    assert!(ctx.has_resource(factory.id()));
    manager.commit(&mut ctx, outer).await.unwrap();
    assert_eq!(1, recorder.count(|op| matches!(op, Operation::TxCommit { .. })));
    assert_eq!(1, recorder.channels_opened());
}

#[tokio::test]
async fn a_failing_participant_dooms_the_whole_transaction() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let outer = manager.begin(&mut ctx, &required()).await.unwrap();
    let inner = manager.begin(&mut ctx, &required()).await.unwrap();
    assert!(!inner.is_new_transaction());

    // Act
    manager.rollback(&mut ctx, inner).await.unwrap();
    let err = manager.commit(&mut ctx, outer).await.unwrap_err();

    // Assert
    assert!(matches!(err, TransactionError::UnexpectedRollback));
    assert_eq!(1, recorder.count(|op| matches!(op, Operation::TxRollback { .. })));
    assert!(!ctx.has_resource(factory.id()));
}

#[tokio::test]
async fn requires_new_suspends_and_resumes_the_outer_transaction() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let outer = manager.begin(&mut ctx, &required()).await.unwrap();
    let outer_holder = ctx.get_resource(factory.id()).unwrap();

    // Act
    let inner = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::RequiresNew))
        .await
        .unwrap();

    // Assert
    assert!(inner.is_new_transaction());
    assert!(inner.has_suspended_resources());
    let inner_holder = ctx.get_resource(factory.id()).unwrap();
    assert!(!Arc::ptr_eq(&outer_holder, &inner_holder));
    assert_eq!(2, recorder.channels_opened());

    manager.commit(&mut ctx, inner).await.unwrap();
    assert!(Arc::ptr_eq(&outer_holder, &ctx.get_resource(factory.id()).unwrap()));
    manager.commit(&mut ctx, outer).await.unwrap();
    assert!(!ctx.has_resource(factory.id()));
}

#[tokio::test]
async fn not_supported_runs_without_a_transaction_then_resumes() {
    let (manager, factory, _recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let outer = manager.begin(&mut ctx, &required()).await.unwrap();

    let inner = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::NotSupported))
        .await
        .unwrap();

    assert!(!inner.has_transaction());
    assert!(!ctx.has_resource(factory.id()));
    manager.commit(&mut ctx, inner).await.unwrap();
    assert!(ctx.has_resource(factory.id()));
    manager.commit(&mut ctx, outer).await.unwrap();
}

#[tokio::test]
async fn propagation_rules_are_enforced() {
    let (manager, _factory, _recorder) = get_manager();
    let mut ctx = ResourceContext::new();

    let err = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::Mandatory))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::IllegalTransactionState(_)));

    let supports = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::Supports))
        .await
        .unwrap();
    assert!(!supports.has_transaction());
    manager.commit(&mut ctx, supports).await.unwrap();

    let outer = manager.begin(&mut ctx, &required()).await.unwrap();
    let err = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::Never))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::IllegalTransactionState(_)));
    let err = manager
        .begin(&mut ctx, &TransactionDefinition::with_propagation(Propagation::Nested))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::NestedTransactionNotSupported));
    manager.rollback(&mut ctx, outer).await.unwrap();
}

#[tokio::test]
async fn only_the_default_isolation_level_is_supported() {
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();

    let err = manager
        .begin(
            &mut ctx,
            &TransactionDefinition::default().isolation(IsolationLevel::Serializable),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::InvalidIsolationLevel));
    assert!(!ctx.has_resource(factory.id()));
    assert_eq!(0, recorder.connections_opened());
}

#[tokio::test]
async fn the_consumer_channel_is_left_open_after_completion() {
    // Arrange
    let (manager, factory, recorder) = get_manager();
    let mut ctx = ResourceContext::new();
    let status = manager.begin(&mut ctx, &required()).await.unwrap();
    let channel = ctx.get_resource(factory.id()).unwrap().channel().unwrap();
    ctx.register_consumer_channel(factory.id(), channel.clone());

    // Act
    manager.commit(&mut ctx, status).await.unwrap();

    // Assert
    assert_eq!(0, factory.cached_channel_count(true));
    assert_eq!(0, recorder.channels_closed());
    assert_eq!(Some(channel), ctx.unregister_consumer_channel(factory.id()));
}

#[tokio::test]
async fn a_broker_failure_prevents_the_transaction_from_starting() {
    let (manager, factory, recorder) = get_manager();
    recorder.fail_next_connects(true);
    let mut ctx = ResourceContext::new();

    let err = manager.begin(&mut ctx, &required()).await.unwrap_err();

    assert!(matches!(err, TransactionError::CannotCreateTransaction(_)));
    assert!(!ctx.has_resource(factory.id()));
}

#[tokio::test]
async fn the_default_timeout_applies_when_none_is_requested() {
    let (factory, _recorder) = get_caching_factory(1);
    let manager = RabbitTransactionManager::new(Arc::new(factory.clone()))
        .with_default_timeout(std::time::Duration::from_secs(30));
    let mut ctx = ResourceContext::new();

    let status = manager.begin(&mut ctx, &required()).await.unwrap();

    assert!(ctx.get_resource(factory.id()).unwrap().has_timeout());
    manager.commit(&mut ctx, status).await.unwrap();
}
