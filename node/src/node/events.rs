//! Node-level event broadcasting.
//!
//! Background work (the announce loop, discovery watches, teardown) never
//! returns errors to a caller; failures are logged and published here instead.

use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Something that happened inside a node's background machinery.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// An announce tick wrote a changed entry set.
    Announced {
        /// Entries newly written.
        added: usize,
        /// Entries deleted.
        removed: usize,
    },
    /// An announce tick renewed the lease without rewriting keys.
    LeaseRenewed,
    /// The lease was lost and a new one granted.
    LeaseRegranted,
    /// An announce tick failed; the loop keeps running.
    AnnounceFailed {
        /// Failure description.
        error: String,
    },
    /// The discovery watch of one entry failed; it is rebuilt on next use.
    WatchFailed {
        /// Entry whose watch failed.
        entry: String,
        /// Failure description.
        error: String,
    },
    /// A teardown step failed; the remaining steps still ran.
    TeardownFailed {
        /// Step that failed.
        step: &'static str,
        /// Failure description.
        error: String,
    },
    /// `destroy` finished.
    Destroyed,
}

/// Fan-out of [`NodeEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; dropped silently when nobody listens.
    pub fn publish(&self, event: NodeEvent) {
        if self.sender.send(event).is_err() {
            trace!("Node event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        bus.publish(NodeEvent::LeaseRenewed);

        let mut rx = bus.subscribe();
        bus.publish(NodeEvent::Destroyed);
        assert_eq!(rx.recv().await.ok(), Some(NodeEvent::Destroyed));
    }
}
