use std::sync::{Arc, Mutex};

use crate::protocol::BridgeMessage;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a new receiver that
/// will receive all messages published after the subscription was created.
/// Dropping the receiver is the unsubscribe: disconnected receivers are pruned
/// on the next publish. The bus is thread-safe and can be cloned cheaply.
pub struct EventBus<T = BridgeMessage> {
    inner: Arc<Mutex<Vec<flume::Sender<T>>>>,
}

impl<T: Clone> EventBus<T> {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish a message to all current subscribers. Fire-and-forget: this
    /// never blocks and never fails.
    pub fn publish(&self, msg: T) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.iter().filter(|tx| !tx.is_disconnected()).count()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("senders", &count).finish()
    }
}
