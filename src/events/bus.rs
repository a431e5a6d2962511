//! In-memory event bus with topic fan-out
//!
//! Topics are strings like `course:42` or `user:7`. Subscribing and
//! unsubscribing are O(1); a topic's channel is dropped lazily once it
//! has no receivers left.

use super::EventFrame;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Process-wide SSE topic manager
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<EventFrame>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Topic name for one course's events
    pub fn course_topic(course_id: i64) -> String {
        format!("course:{course_id}")
    }

    /// Topic name for one user's events
    pub fn user_topic(owner_id: i64) -> String {
        format!("user:{owner_id}")
    }

    /// Subscribe to a topic. The subscription ends when the receiver drops.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventFrame> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a frame to a topic. Frames published with no subscribers
    /// are dropped; the durable record is the course_events table.
    pub fn publish(&self, topic: &str, frame: EventFrame) {
        let mut topics = self.topics.lock().unwrap();
        let orphaned = topics
            .get(topic)
            .is_some_and(|sender| sender.send(frame).is_err());
        if orphaned {
            // Last receiver is gone; reclaim the topic entry
            topics.remove(topic);
        }
    }

    /// Explicit teardown for process shutdown
    pub fn shutdown(&self) {
        self.topics.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(event_type: &str) -> EventFrame {
        EventFrame {
            event_type: event_type.to_string(),
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("course:1");
        let mut rx2 = bus.subscribe("course:1");

        bus.publish("course:1", frame("tool_started"));

        assert_eq!(rx1.recv().await.unwrap().event_type, "tool_started");
        assert_eq!(rx2.recv().await.unwrap().event_type, "tool_started");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("course:1");

        bus.publish("course:2", frame("tool_started"));
        bus.publish("course:1", frame("concierge_complete"));

        assert_eq!(rx.recv().await.unwrap().event_type, "concierge_complete");
    }

    #[tokio::test]
    async fn test_orphan_topic_reclaimed() {
        let bus = EventBus::new();
        let rx = bus.subscribe("course:1");
        drop(rx);

        bus.publish("course:1", frame("x"));
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("course:9", frame("x"));
        assert_eq!(bus.topic_count(), 0);
    }
}
