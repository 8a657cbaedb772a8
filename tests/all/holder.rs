use std::sync::Arc;
use std::time::Duration;

use carrot_cellar::connection::{Channel, ConnectionFactory};
use carrot_cellar::transaction::{
    get_transactional_resource_holder, is_channel_transactional, ResourceContext,
    ResourceHolder, TransactionError,
};

use crate::helpers::{channel_id, get_caching_factory, Operation};

#[tokio::test]
async fn commit_acknowledges_pending_deliveries_then_commits() {
    // Arrange
    let (factory, recorder) = get_caching_factory(2);
    let connection = factory.create_connection().await.unwrap();
    let transactional = connection.create_channel(true).await.unwrap();
    let idle = connection.create_channel(false).await.unwrap();
    let holder = ResourceHolder::new();
    holder.add_connection(connection.clone()).unwrap();
    holder.add_channel(transactional.clone(), Some(&connection)).unwrap();
    holder.add_channel(idle.clone(), Some(&connection)).unwrap();
    for delivery_tag in [1, 2, 3] {
        holder.add_delivery_tag(&transactional, delivery_tag);
    }

    // Act
    holder.commit_all().await.unwrap();

    // Assert
    let channel = channel_id(&transactional);
    assert_eq!(
        vec![
            Operation::OpenChannel { channel },
            Operation::TxSelect { channel },
            Operation::Ack { channel, delivery_tag: 1 },
            Operation::Ack { channel, delivery_tag: 2 },
            Operation::Ack { channel, delivery_tag: 3 },
            Operation::TxCommit { channel },
        ],
        recorder.channel_operations(channel)
    );
    let idle = channel_id(&idle);
    assert_eq!(
        vec![Operation::OpenChannel { channel: idle }],
        recorder.channel_operations(idle)
    );
}

#[tokio::test]
async fn pending_deliveries_are_acknowledged_only_once() {
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::with_channel(channel.clone());
    holder.add_delivery_tag(&channel, 7);

    holder.commit_all().await.unwrap();
    holder.commit_all().await.unwrap();

    assert_eq!(1, recorder.count(|op| matches!(op, Operation::Ack { .. })));
    assert!(holder.delivery_tags(&channel).is_empty());
}

#[tokio::test]
async fn rollback_rejects_and_requeues_pending_deliveries_on_every_channel() {
    // Arrange
    let (factory, recorder) = get_caching_factory(2);
    let connection = factory.create_connection().await.unwrap();
    let a = connection.create_channel(true).await.unwrap();
    let b = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::new();
    // Insertion order differs from creation order.
    holder.add_channel(b.clone(), Some(&connection)).unwrap();
    holder.add_channel(a.clone(), Some(&connection)).unwrap();
    holder.add_delivery_tag(&a, 1);
    holder.add_delivery_tag(&b, 2);
    holder.add_delivery_tag(&b, 3);

    // Act
    holder.rollback_all().await.unwrap();

    // Assert
    let a = channel_id(&a);
    assert_eq!(
        vec![
            Operation::TxRollback { channel: a },
            Operation::Reject { channel: a, delivery_tag: 1, requeue: true },
            Operation::TxCommit { channel: a },
        ],
        recorder.channel_operations(a)[2..].to_vec()
    );
    let b = channel_id(&b);
    assert_eq!(
        vec![
            Operation::TxRollback { channel: b },
            Operation::Reject { channel: b, delivery_tag: 2, requeue: true },
            Operation::Reject { channel: b, delivery_tag: 3, requeue: true },
            Operation::TxCommit { channel: b },
        ],
        recorder.channel_operations(b)[2..].to_vec()
    );
}

#[tokio::test]
async fn a_failing_commit_is_reported() {
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::with_channel(channel);
    recorder.fail_commits(true);

    let err = holder.commit_all().await.unwrap_err();

    assert!(matches!(err, TransactionError::Amqp { .. }));
}

#[tokio::test]
async fn a_transactional_channel_without_pending_deliveries_is_still_committed() {
    // Arrange
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::with_channel(channel.clone());
    // Work done straight on the channel only reaches the broker with the channel transaction.
    channel.basic_ack(9).await.unwrap();

    // Act
    holder.commit_all().await.unwrap();

    // Assert
    let channel = channel_id(&channel);
    assert_eq!(
        vec![
            Operation::OpenChannel { channel },
            Operation::TxSelect { channel },
            Operation::Ack { channel, delivery_tag: 9 },
            Operation::TxCommit { channel },
        ],
        recorder.channel_operations(channel)
    );
}

#[tokio::test]
async fn a_failing_commit_leaves_earlier_channels_committed() {
    // Arrange
    let (factory, recorder) = get_caching_factory(2);
    let connection = factory.create_connection().await.unwrap();
    let first = connection.create_channel(true).await.unwrap();
    let second = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::new();
    holder.add_channel(first.clone(), Some(&connection)).unwrap();
    holder.add_channel(second.clone(), Some(&connection)).unwrap();
    holder.add_delivery_tag(&first, 1);
    holder.add_delivery_tag(&second, 2);
    recorder.fail_commits_after(1);

    // Act
    let err = holder.commit_all().await.unwrap_err();

    // Assert
    assert!(matches!(err, TransactionError::Amqp { .. }));
    let first = channel_id(&first);
    assert_eq!(
        vec![
            Operation::Ack { channel: first, delivery_tag: 1 },
            Operation::TxCommit { channel: first },
        ],
        recorder.channel_operations(first)[2..].to_vec()
    );
    let second = channel_id(&second);
    assert_eq!(
        vec![Operation::Ack { channel: second, delivery_tag: 2 }],
        recorder.channel_operations(second)[2..].to_vec()
    );
}

#[tokio::test]
async fn a_frozen_holder_does_not_accept_new_resources() {
    let (factory, _recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(false).await.unwrap();
    let holder = ResourceHolder::new();

    holder.freeze();

    assert!(holder.is_frozen());
    assert!(matches!(
        holder.add_connection(connection.clone()),
        Err(TransactionError::ResourceFrozen(_))
    ));
    assert!(matches!(
        holder.add_channel(channel, Some(&connection)),
        Err(TransactionError::ResourceFrozen(_))
    ));
    assert!(holder.channel().is_none());
}

#[tokio::test]
async fn adding_the_same_resources_twice_is_a_no_op() {
    let (factory, _recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(false).await.unwrap();
    let holder = ResourceHolder::new();

    holder.add_connection(connection.clone()).unwrap();
    holder.add_connection(connection.clone()).unwrap();
    holder.add_channel(channel.clone(), Some(&connection)).unwrap();
    holder.add_channel(channel.clone(), Some(&connection)).unwrap();

    assert_eq!(vec![channel.clone()], holder.channels());
    assert_eq!(vec![channel.clone()], holder.channels_for(&connection));
    assert_eq!(Some(connection), holder.connection());
    assert!(holder.contains_channel(&channel));
}

#[tokio::test]
async fn close_all_returns_channels_to_the_factory_except_the_consumer_one() {
    // Arrange
    let (factory, recorder) = get_caching_factory(2);
    let connection = factory.create_connection().await.unwrap();
    let consumer = connection.create_channel(true).await.unwrap();
    let other = connection.create_channel(true).await.unwrap();
    let holder = ResourceHolder::new();
    holder.add_connection(connection.clone()).unwrap();
    holder.add_channel(consumer.clone(), Some(&connection)).unwrap();
    holder.add_channel(other.clone(), Some(&connection)).unwrap();
    holder.add_delivery_tag(&other, 1);

    // Act
    holder.close_all(Some(&consumer)).await;

    // Assert
    assert!(holder.channels().is_empty());
    assert!(holder.connection().is_none());
    assert!(holder.delivery_tags(&other).is_empty());
    assert_eq!(1, factory.cached_channel_count(true));
    assert_eq!(other, connection.create_channel(true).await.unwrap());
    assert!(consumer.is_open());
    assert_eq!(0, recorder.channels_closed());
    assert_eq!(0, recorder.connections_closed());
}

#[tokio::test]
async fn declaring_a_holder_transactional_selects_tx_mode_once() {
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(false).await.unwrap();
    let holder = ResourceHolder::with_channel(channel.clone());

    holder.declare_transactional().await.unwrap();
    holder.declare_transactional().await.unwrap();

    assert!(holder.is_transactional());
    assert!(channel.is_tx_selected());
    assert_eq!(1, recorder.tx_selects());
}

#[tokio::test]
async fn a_holder_synchronized_with_a_transaction_is_not_redeclared() {
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    let channel = connection.create_channel(false).await.unwrap();
    let holder = ResourceHolder::with_channel(channel);
    holder.set_synchronized_with_transaction(true);

    holder.declare_transactional().await.unwrap();

    assert!(!holder.is_transactional());
    assert_eq!(0, recorder.tx_selects());
}

#[test]
fn an_expired_deadline_marks_the_holder_rollback_only() {
    let holder = ResourceHolder::new();
    assert!(matches!(holder.time_to_live(), Ok(None)));

    holder.set_timeout(Duration::from_secs(60));
    let time_to_live = holder.time_to_live().unwrap().unwrap();
    assert!(time_to_live <= Duration::from_secs(60));
    assert!(!holder.is_rollback_only());

    holder.set_timeout(Duration::ZERO);
    assert!(matches!(
        holder.time_to_live(),
        Err(TransactionError::TimedOut { .. })
    ));
    assert!(holder.is_rollback_only());

    holder.clear();
    assert!(!holder.has_timeout());
    assert!(!holder.is_rollback_only());
}

#[tokio::test]
async fn binding_a_second_holder_for_the_same_factory_fails() {
    let (factory, _recorder) = get_caching_factory(1);
    let mut ctx = ResourceContext::new();
    ctx.bind_resource(factory.id(), Arc::new(ResourceHolder::new()))
        .unwrap();

    let err = ctx
        .bind_resource(factory.id(), Arc::new(ResourceHolder::new()))
        .unwrap_err();

    assert!(matches!(err, TransactionError::AlreadyBound(id) if id == factory.id()));
    ctx.unbind_resource(factory.id()).unwrap();
    assert!(matches!(
        ctx.unbind_resource(factory.id()),
        Err(TransactionError::NotBound(_))
    ));
    assert!(ctx
        .bind_resource(factory.id(), Arc::new(ResourceHolder::new()))
        .is_ok());
}

#[tokio::test]
async fn a_synchronized_holder_is_bound_and_reused() {
    // Arrange
    let (factory, recorder) = get_caching_factory(1);
    let mut ctx = ResourceContext::new();

    // Act
    let first = get_transactional_resource_holder(&mut ctx, &factory, true)
        .await
        .unwrap();
    let second = get_transactional_resource_holder(&mut ctx, &factory, true)
        .await
        .unwrap();

    // Assert
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_synchronized_with_transaction());
    assert!(ctx.has_resource(factory.id()));
    assert_eq!(1, recorder.channels_opened());
    let channel = first.channel().unwrap();
    assert!(channel.is_tx_selected());
    assert!(is_channel_transactional(&ctx, &channel, &factory));
}

#[tokio::test]
async fn an_unsynchronized_holder_is_not_bound() {
    let (factory, _recorder) = get_caching_factory(1);
    let mut ctx = ResourceContext::new();

    let holder = get_transactional_resource_holder(&mut ctx, &factory, false)
        .await
        .unwrap();

    assert!(!ctx.has_resource(factory.id()));
    let channel = holder.channel().unwrap();
    assert!(!is_channel_transactional(&ctx, &channel, &factory));
}

#[tokio::test]
async fn a_broker_that_cannot_be_reached_surfaces_a_connection_error() {
    let (factory, recorder) = get_caching_factory(1);
    let connection = factory.create_connection().await.unwrap();
    crate::helpers::fake_connection(&connection).kill();
    recorder.fail_next_connects(true);
    let mut ctx = ResourceContext::new();

    let err = get_transactional_resource_holder(&mut ctx, &factory, true)
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Connection(_)));
    assert!(!ctx.has_resource(factory.id()));
}
