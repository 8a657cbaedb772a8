//! What a caller asks for when starting a transaction.
use std::time::Duration;

/// How a new transactional scope relates to the one already bound, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Join the current transaction, or start a new one.
    #[default]
    Required,
    /// Join the current transaction, or run without one.
    Supports,
    /// Join the current transaction, fail if there is none.
    Mandatory,
    /// Suspend the current transaction, if any, and start a new one.
    RequiresNew,
    /// Suspend the current transaction, if any, and run without one.
    NotSupported,
    /// Fail if there is a current transaction.
    Never,
    /// Savepoints: not available in AMQP.
    Nested,
}

/// Isolation levels. AMQP has no such concept: only [`IsolationLevel::Default`] is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// The attributes of a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: IsolationLevel,
    /// `None` falls back to the transaction manager default.
    pub timeout: Option<Duration>,
    /// Used in logs only.
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn with_propagation(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
