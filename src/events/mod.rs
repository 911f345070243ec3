//! Event bus for session notifications
//!
//! The orchestrator publishes every state change here; the presentation
//! layer (the CLI in this crate) subscribes and renders.

pub mod types;

pub use types::{CallEndReason, SessionEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting session events
///
/// Backed by a tokio broadcast channel; every active subscriber receives
/// every event published after it subscribed.
///
/// # Example
///
/// ```no_run
/// use paircall::events::{EventBus, SessionEvent};
/// use paircall::negotiation::ConnectionQuality;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SessionEvent::QualityChanged {
///     quality: ConnectionQuality::Excellent,
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published while nobody is subscribed are dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls more than the channel capacity behind
    /// receives `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
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
    use crate::negotiation::ConnectionQuality;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::QualityChanged {
            quality: ConnectionQuality::Poor,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            SessionEvent::QualityChanged {
                quality: ConnectionQuality::Poor
            }
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SessionEvent::Error {
            message: "Lost connection to the server.".to_string(),
            retryable: false,
        });

        assert!(matches!(rx1.recv().await.unwrap(), SessionEvent::Error { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SessionEvent::Error { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(SessionEvent::Error {
            message: "test".to_string(),
            retryable: true,
        });
    }
}
