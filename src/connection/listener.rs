//! Observers notified when physical connections come and go.
use std::sync::Arc;

use super::ConnectionProxy;

/// Notified synchronously when a physical connection is created or closed.
///
/// Implementations must not panic: the factories do not guard against it.
pub trait ConnectionListener: Send + Sync {
    fn on_create(&self, connection: &ConnectionProxy);

    fn on_close(&self, connection: &ConnectionProxy);
}

/// Fans out connection events to every registered listener, in registration order.
#[derive(Clone, Default)]
pub struct CompositeConnectionListener {
    delegates: Vec<Arc<dyn ConnectionListener>>,
}

impl CompositeConnectionListener {
    pub fn new(delegates: Vec<Arc<dyn ConnectionListener>>) -> Self {
        Self { delegates }
    }

    pub fn add(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.delegates.push(listener);
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl ConnectionListener for CompositeConnectionListener {
    fn on_create(&self, connection: &ConnectionProxy) {
        for delegate in &self.delegates {
            delegate.on_create(connection);
        }
    }

    fn on_close(&self, connection: &ConnectionProxy) {
        for delegate in &self.delegates {
            delegate.on_close(connection);
        }
    }
}
