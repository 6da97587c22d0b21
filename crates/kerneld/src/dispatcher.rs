use std::sync::{Arc, PoisonError, RwLock};

use kernel_wire::Envelope;

pub type MessageCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Ordered list of callbacks for one channel.
///
/// Callbacks run outside the lock, so a callback may register another or
/// clear the list without deadlocking; such changes apply from the next
/// message on.
#[derive(Default)]
pub struct CallbackDispatcher {
    callbacks: RwLock<Vec<MessageCallback>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: MessageCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Invoke every callback in registration order.
    pub fn run_callbacks(&self, message: &Envelope) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(message);
        }
    }

    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
