//! Resource transactions: binding channels to a unit of work and committing or rolling back
//! exactly the channels and deliveries that took part in it.
mod context;
mod definition;
mod error;
mod holder;
mod manager;
mod utils;

pub use context::ResourceContext;
pub use definition::{IsolationLevel, Propagation, TransactionDefinition};
pub use error::TransactionError;
pub use holder::ResourceHolder;
pub use manager::{RabbitTransactionManager, TransactionObject, TransactionState, TransactionStatus};
pub use utils::{
    create_transactional_resource_holder, get_transactional_resource_holder,
    is_channel_transactional, release_connection, release_resources,
};
