//! Event hub: topic-per-aggregate pub/sub
//!
//! Consumers subscribe to `catalog`, `partition`, or `flow:<id>` topics and
//! receive events after they are durably appended, in append order. Lagging
//! subscribers lose oldest events (broadcast semantics); the event log is
//! the source of truth for catch-up.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};

use super::event_types::StoredEvent;

/// Capacity for broadcast channels
const CHANNEL_CAPACITY: usize = 256;

/// A filtered subscription to one topic
pub struct Subscription {
    receiver: broadcast::Receiver<StoredEvent>,
    event_types: Vec<String>,
}

impl Subscription {
    /// Receive the next matching event, or `None` once the topic closes
    pub async fn recv(&mut self) -> Option<StoredEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &StoredEvent) -> bool {
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|t| t == event.event().event_type())
    }
}

/// Broadcast hub keyed by topic
#[derive(Default)]
pub struct Hub {
    topics: RwLock<HashMap<String, broadcast::Sender<StoredEvent>>>,
}

impl Hub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, optionally filtered to specific event types.
    ///
    /// Creates the topic channel when it does not exist yet.
    pub async fn subscribe(&self, topic: &str, event_types: Vec<String>) -> Subscription {
        let mut topics = self.topics.write().await;

        let receiver = if let Some(sender) = topics.get(topic) {
            sender.subscribe()
        } else {
            let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
            topics.insert(topic.to_string(), tx);
            rx
        };

        Subscription {
            receiver,
            event_types,
        }
    }

    /// Publish events to a topic, in order.
    ///
    /// Events for topics with no subscribers are dropped silently.
    pub async fn publish(&self, topic: &str, events: &[StoredEvent]) {
        let topics = self.topics.read().await;
        if let Some(sender) = topics.get(topic) {
            for event in events {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop a topic channel once its last subscriber disconnected
    pub async fn cleanup(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, Event};

    fn stored(version: u64, event: Event) -> StoredEvent {
        StoredEvent {
            version,
            envelope: Envelope::now(event),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("flow:f1", vec![]).await;

        hub.publish(
            "flow:f1",
            &[stored(
                1,
                Event::FlowCompleted {
                    flow_id: "f1".to_string(),
                },
            )],
        )
        .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event().event_type(), "flow_completed");
    }

    #[tokio::test]
    async fn test_filter_by_event_type() {
        let hub = Hub::new();
        let mut sub = hub
            .subscribe("flow:f1", vec!["flow_failed".to_string()])
            .await;

        hub.publish(
            "flow:f1",
            &[
                stored(
                    1,
                    Event::FlowCompleted {
                        flow_id: "f1".to_string(),
                    },
                ),
                stored(
                    2,
                    Event::FlowFailed {
                        flow_id: "f1".to_string(),
                        error: "boom".to_string(),
                    },
                ),
            ],
        )
        .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event().event_type(), "flow_failed");
        assert_eq!(event.version, 2);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = Hub::new();
        let mut catalog_sub = hub.subscribe("catalog", vec![]).await;

        hub.publish(
            "flow:f1",
            &[stored(
                1,
                Event::FlowActivated {
                    flow_id: "f1".to_string(),
                },
            )],
        )
        .await;
        hub.publish(
            "catalog",
            &[stored(
                1,
                Event::StepUnregistered {
                    step_id: "s".to_string(),
                },
            )],
        )
        .await;

        let event = catalog_sub.recv().await.unwrap();
        assert_eq!(event.event().event_type(), "step_unregistered");
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle_topic() {
        let hub = Hub::new();
        let sub = hub.subscribe("flow:f1", vec![]).await;
        drop(sub);

        hub.cleanup("flow:f1").await;
        assert!(hub.topics.read().await.get("flow:f1").is_none());
    }
}
