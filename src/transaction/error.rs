use crate::connection::{ConnectionError, FactoryId};

/// Error returned by resource holders, the resource context and the transaction manager.
#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    #[error("Cannot add {0} because the resource holder is frozen")]
    ResourceFrozen(&'static str),
    #[error("A resource holder is already bound for connection factory {0}")]
    AlreadyBound(FactoryId),
    #[error("No resource holder is bound for connection factory {0}")]
    NotBound(FactoryId),
    /// Commit or rollback failed on at least one channel.
    ///
    /// Channels processed before the failure stay committed (or rolled back):
    /// there is no compensation across channels.
    #[error("{message}")]
    Amqp {
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("AMQP does not support an isolation level concept")]
    InvalidIsolationLevel,
    #[error("Could not create AMQP transaction")]
    CannotCreateTransaction(#[source] Box<TransactionError>),
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(&'static str),
    #[error("Transaction rolled back because it has been marked as rollback-only")]
    UnexpectedRollback,
    #[error("Transaction timed out: deadline exceeded by {overdue:?}")]
    TimedOut { overdue: std::time::Duration },
    #[error("Nested transactions are not supported by AMQP")]
    NestedTransactionNotSupported,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TransactionError {
    pub(crate) fn amqp(message: &'static str, source: anyhow::Error) -> Self {
        Self::Amqp { message, source }
    }
}
