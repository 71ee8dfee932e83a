//! Event bus
//!
//! Decouples the pairing agent, the peer coordinator and the supervisor:
//! each publishes what happened and subscribes to what it reacts to.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`SystemEvent`]s
///
/// Slow subscribers see `Lagged` and miss events rather than blocking
/// publishers.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
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

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SystemEvent::AgentReleased);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SystemEvent::AgentReleased);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::SystemError {
            module: "bridge".to_string(),
            message: "device gone".to_string(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), SystemEvent::SystemError { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SystemEvent::SystemError { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(SystemEvent::PairingCancelled);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
