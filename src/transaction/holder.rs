//! The bag of connections, channels and pending acknowledgements claimed by a transaction.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::utils::release_connection;
use super::TransactionError;
use crate::connection::{Channel, ChannelProxy, ConnectionProxy, DeliveryTag};

/// Connections, channels and delivery tags taking part in one transaction.
///
/// A holder is usually created by
/// [`get_transactional_resource_holder`](super::get_transactional_resource_holder) and bound to a
/// [`ResourceContext`](super::ResourceContext), so that nested code reuses the same channel.
///
/// The internal bookkeeping is locked only while it is mutated: acknowledgements, commits
/// and closes run without holding the lock.
#[derive(Default)]
pub struct ResourceHolder {
    state: Mutex<HolderState>,
}

#[derive(Default)]
struct HolderState {
    frozen: bool,
    transactional: bool,
    synchronized_with_transaction: bool,
    rollback_only: bool,
    deadline: Option<Instant>,
    connections: Vec<ConnectionProxy>,
    channels: Vec<ChannelProxy>,
    channels_per_connection: HashMap<ConnectionProxy, Vec<ChannelProxy>>,
    delivery_tags: HashMap<ChannelProxy, Vec<DeliveryTag>>,
}

impl ResourceHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A holder for a channel obtained outside of a transaction, e.g. a consumer channel.
    pub fn with_channel(channel: ChannelProxy) -> Self {
        let holder = Self::new();
        holder.state.lock().channels.push(channel);
        holder
    }

    /// Forbid any further connection or channel from joining this holder.
    pub fn freeze(&self) {
        self.state.lock().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    /// Track a connection. Adding the same connection twice is a no-op.
    pub fn add_connection(&self, connection: ConnectionProxy) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(TransactionError::ResourceFrozen("Connection"));
        }
        if !state.connections.contains(&connection) {
            state.connections.push(connection);
        }
        Ok(())
    }

    /// Track a channel, optionally recording the connection it was opened on.
    /// Adding the same channel twice is a no-op.
    pub fn add_channel(
        &self,
        channel: ChannelProxy,
        connection: Option<&ConnectionProxy>,
    ) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(TransactionError::ResourceFrozen("Channel"));
        }
        if state.channels.contains(&channel) {
            return Ok(());
        }
        state.channels.push(channel.clone());
        if let Some(connection) = connection {
            state
                .channels_per_connection
                .entry(connection.clone())
                .or_default()
                .push(channel);
        }
        Ok(())
    }

    pub fn contains_channel(&self, channel: &ChannelProxy) -> bool {
        self.state.lock().channels.contains(channel)
    }

    /// The first connection added to this holder.
    pub fn connection(&self) -> Option<ConnectionProxy> {
        self.state.lock().connections.first().cloned()
    }

    /// The first channel added to this holder.
    pub fn channel(&self) -> Option<ChannelProxy> {
        self.state.lock().channels.first().cloned()
    }

    pub fn channels(&self) -> Vec<ChannelProxy> {
        self.state.lock().channels.clone()
    }

    /// The channels opened on `connection`, in the order they were added.
    pub fn channels_for(&self, connection: &ConnectionProxy) -> Vec<ChannelProxy> {
        self.state
            .lock()
            .channels_per_connection
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    /// Record a delivery to be acknowledged on commit, or rejected on rollback.
    pub fn add_delivery_tag(&self, channel: &ChannelProxy, delivery_tag: DeliveryTag) {
        self.state
            .lock()
            .delivery_tags
            .entry(channel.clone())
            .or_default()
            .push(delivery_tag);
    }

    /// The deliveries pending on `channel`, in the order they were added.
    pub fn delivery_tags(&self, channel: &ChannelProxy) -> Vec<DeliveryTag> {
        self.state
            .lock()
            .delivery_tags
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    fn take_delivery_tags(&self, channel: &ChannelProxy) -> Vec<DeliveryTag> {
        self.state
            .lock()
            .delivery_tags
            .remove(channel)
            .unwrap_or_default()
    }

    /// Whether `channel` has to be committed or rolled back explicitly.
    fn is_channel_transactional(&self, channel: &ChannelProxy) -> bool {
        channel.is_tx_selected()
    }

    /// Acknowledge every pending delivery, in order, then commit each transactional channel.
    ///
    /// A transactional channel is committed even when no delivery is pending on it: whatever
    /// a caller did on it directly (publishes, plain acks) only reaches the broker with
    /// `tx.commit`. Non-transactional channels without pending deliveries are not touched.
    ///
    /// The first failure aborts the loop: channels processed before it stay committed,
    /// channels after it are left untouched.
    pub async fn commit_all(&self) -> Result<(), TransactionError> {
        const MESSAGE: &str = "Failed to commit RabbitMQ transaction";
        for channel in self.channels() {
            for delivery_tag in self.take_delivery_tags(&channel) {
                channel
                    .basic_ack(delivery_tag)
                    .await
                    .map_err(|e| TransactionError::amqp(MESSAGE, e))?;
            }
            if self.is_channel_transactional(&channel) {
                channel
                    .tx_commit()
                    .await
                    .map_err(|e| TransactionError::amqp(MESSAGE, e))?;
            }
        }
        Ok(())
    }

    /// Roll back each transactional channel, then reject (and requeue) every pending delivery.
    ///
    /// On a transactional channel the rejections are committed, otherwise the broker would
    /// never see them.
    pub async fn rollback_all(&self) -> Result<(), TransactionError> {
        const MESSAGE: &str = "Failed to roll back RabbitMQ transaction";
        for channel in self.channels() {
            debug!("Rolling back messages on channel: {:?}", channel);
            let transactional = self.is_channel_transactional(&channel);
            if transactional {
                channel
                    .tx_rollback()
                    .await
                    .map_err(|e| TransactionError::amqp(MESSAGE, e))?;
            }
            let delivery_tags = self.take_delivery_tags(&channel);
            if delivery_tags.is_empty() {
                continue;
            }
            for delivery_tag in delivery_tags {
                channel
                    .basic_reject(delivery_tag, true)
                    .await
                    .map_err(|e| TransactionError::amqp(MESSAGE, e))?;
            }
            if transactional {
                channel
                    .tx_commit()
                    .await
                    .map_err(|e| TransactionError::amqp(MESSAGE, e))?;
            }
        }
        Ok(())
    }

    /// Close every channel, release every connection, then forget about all of them.
    ///
    /// `consumer_channel` is skipped: it belongs to a consumer that keeps using it.
    pub async fn close_all(&self, consumer_channel: Option<&ChannelProxy>) {
        let (channels, connections) = {
            let mut state = self.state.lock();
            state.channels_per_connection.clear();
            state.delivery_tags.clear();
            (
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.connections),
            )
        };
        for channel in channels {
            if Some(&channel) == consumer_channel {
                continue;
            }
            if let Err(e) = channel.close().await {
                debug!("Could not close synchronized RabbitMq channel after transaction: {:?}", e);
            }
        }
        for connection in connections {
            release_connection(&connection).await;
        }
    }

    /// Turn every channel of this holder into a transactional one.
    ///
    /// Idempotent, and a no-op for holders synchronized with an existing transaction.
    pub async fn declare_transactional(&self) -> Result<(), TransactionError> {
        let channels = {
            let state = self.state.lock();
            if state.synchronized_with_transaction || state.transactional {
                return Ok(());
            }
            state.channels.clone()
        };
        for channel in &channels {
            if !channel.is_tx_selected() {
                channel.tx_select().await.map_err(|e| {
                    TransactionError::amqp("Failed to declare RabbitMQ channel transactional", e)
                })?;
            }
        }
        self.state.lock().transactional = !channels.is_empty();
        Ok(())
    }

    pub fn is_transactional(&self) -> bool {
        self.state.lock().transactional
    }

    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.state.lock().synchronized_with_transaction
    }

    pub fn set_synchronized_with_transaction(&self, synchronized: bool) {
        self.state.lock().synchronized_with_transaction = synchronized;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    pub fn set_rollback_only(&self, rollback_only: bool) {
        self.state.lock().rollback_only = rollback_only;
    }

    /// Start the transaction deadline clock.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().deadline = Some(Instant::now() + timeout);
    }

    pub fn has_timeout(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// Time left before the deadline; `None` if there is no deadline.
    ///
    /// Once the deadline has passed the holder is marked rollback-only and
    /// [`TransactionError::TimedOut`] is returned.
    pub fn time_to_live(&self) -> Result<Option<Duration>, TransactionError> {
        let mut state = self.state.lock();
        let Some(deadline) = state.deadline else {
            return Ok(None);
        };
        let now = Instant::now();
        if now >= deadline {
            state.rollback_only = true;
            return Err(TransactionError::TimedOut {
                overdue: now - deadline,
            });
        }
        Ok(Some(deadline - now))
    }

    /// Reset the transactional state (synchronization, rollback-only, deadline).
    /// Tracked resources are left alone: use [`close_all`](Self::close_all) for those.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.synchronized_with_transaction = false;
        state.rollback_only = false;
        state.deadline = None;
    }
}

impl std::fmt::Debug for ResourceHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceHolder")
            .field("channels", &state.channels)
            .field("connections", &state.connections.len())
            .field("frozen", &state.frozen)
            .field("transactional", &state.transactional)
            .field("rollback_only", &state.rollback_only)
            .finish()
    }
}
