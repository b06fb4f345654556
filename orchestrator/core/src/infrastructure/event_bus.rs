// Event Bus Implementation - Pub/Sub for Lifecycle Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Fans worker lifecycle events out to the hook runner and to control
// connections that subscribed to them.
//
// In-memory only: events published while nobody listens are dropped.

use crate::domain::events::LifecycleEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to lifecycle events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<LifecycleEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1024)
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    /// Publish a lifecycle event to all subscribers
    pub fn publish(&self, event: LifecycleEvent) {
        // send() only fails when there are no receivers
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to lifecycle event");
        }
    }

    /// Subscribe to all lifecycle events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver for all lifecycle events
pub struct EventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::WorkerEvent;
    use crate::domain::worker::InstanceNum;
    use chrono::Utc;

    fn event(instance_num: Option<InstanceNum>, event: WorkerEvent) -> LifecycleEvent {
        LifecycleEvent {
            name: "api".to_string(),
            instance_num,
            event,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(event(Some(1), WorkerEvent::Start { pid: 42 }));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event, WorkerEvent::Start { pid: 42 });
        assert_eq!(received.instance_num, Some(1));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        event_bus.publish(event(Some(1), WorkerEvent::Restart));

        // Both receivers should get the event
        assert_eq!(receiver1.recv().await.unwrap().event, WorkerEvent::Restart);
        assert_eq!(receiver2.recv().await.unwrap().event, WorkerEvent::Restart);
    }

    #[tokio::test]
    async fn test_slow_receiver_reports_lag() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();

        for pid in 0..4 {
            event_bus.publish(event(None, WorkerEvent::Spawn { pid }));
        }

        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(2))));
        assert_eq!(receiver.recv().await.unwrap().event, WorkerEvent::Spawn { pid: 2 });
    }
}
