use eventline::{Destination, NotificationBus, PushMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Push notification bus backed by one broadcast channel per destination.
///
/// Subscribers that fall more than `capacity` messages behind observe a lag
/// and are expected to reread the store.
#[derive(Debug)]
pub struct InMemoryNotificationBus {
    channels: Mutex<HashMap<Destination, broadcast::Sender<PushMessage>>>,
    capacity: usize,
}

impl InMemoryNotificationBus {
    /// Creates a bus buffering up to 1024 messages per destination.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` messages per destination.
    ///
    /// A capacity of 0 is raised to 1.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryNotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus for InMemoryNotificationBus {
    fn subscribe(&self, destination: &Destination) -> broadcast::Receiver<PushMessage> {
        self.channels
            .lock()
            .entry(destination.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn publish(&self, message: PushMessage) {
        let channels = self.channels.lock();
        match channels.get(&message.destination) {
            Some(sender) => {
                let _ = sender.send(message);
            }
            None => trace!(destination = ?message.destination, "no subscribers for push message"),
        }
    }
}
