//! Publish/subscribe channel for platform lifecycle events.
//!
//! The registry only cares about one topic, [`PERSISTENCE_STARTED`]. Other
//! components may publish anything; subscribers compare topics for equality
//! and ignore what they don't handle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Published once the persistence layer accepts sessions.
pub const PERSISTENCE_STARTED: &str = "tds/persistence/started";

/// Published when the persistence layer is going away.
pub const PERSISTENCE_STOPPED: &str = "tds/persistence/stopped";

/// Opaque platform event. Only `topic` is inspected by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TdsEvent {
    pub id: Uuid,
    pub topic: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl TdsEvent {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            properties: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is(&self, topic: &str) -> bool {
        self.topic == topic
    }
}

/// Broadcast bus for [`TdsEvent`]s.
///
/// Publishing never blocks; slow subscribers observe a lag error and keep
/// going. Subscribers only see events published after they subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TdsEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TdsEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers.
    ///
    /// Returns the number of subscribers reached, or the event back if
    /// nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn publish(&self, event: TdsEvent) -> Result<usize, broadcast::error::SendError<TdsEvent>> {
        self.tx.send(event)
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish_lossy(&self, event: TdsEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topic_equality() {
        let e = TdsEvent::new(PERSISTENCE_STARTED);
        assert!(e.is(PERSISTENCE_STARTED));
        assert!(!e.is(PERSISTENCE_STOPPED));
    }

    #[test]
    fn test_publish_without_subscribers_errors() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish(TdsEvent::new(PERSISTENCE_STARTED)).is_err());
        // Should not panic
        bus.publish_lossy(TdsEvent::new(PERSISTENCE_STARTED));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let sent = TdsEvent::new(PERSISTENCE_STARTED).with_property("source", "test");
        assert_eq!(bus.publish(sent.clone()).unwrap(), 1);

        let got = rx.recv().await.unwrap();
        assert_eq!(got, sent);
        assert_eq!(got.properties.get("source").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        assert_eq!(bus.capacity(), 1);
        let _rx = bus.subscribe();
        assert!(bus.publish(TdsEvent::new("x")).is_ok());
    }
}
