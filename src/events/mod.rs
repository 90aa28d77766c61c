//! Event bus for node state notifications
//!
//! Connection observers, recorders and transports publish here; the
//! orchestrator subscribes and reacts (for example, removing a session once
//! its connection has closed).

pub mod types;

pub use types::NodeEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`NodeEvent`]s to every subscriber
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive all future events
    ///
    /// A subscriber that falls too far behind gets `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(NodeEvent::RecordingStarted {
            source: "pir-slot".to_string(),
            path: PathBuf::from("/tmp/a.webm"),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            NodeEvent::RecordingStarted { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            NodeEvent::RecordingStarted { .. }
        ));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(NodeEvent::TrackEnded {
            viewer_id: "v1".to_string(),
        });
    }
}
