//! Course event spine
//!
//! Events are derived data: the durable log is the `course_events`
//! table, the in-memory bus feeds live SSE subscribers, and timelines
//! are recomputed from the log on demand. Emission is fire-and-forget;
//! a failed write is logged and never surfaces to the caller.

pub mod bus;
pub mod timeline;

pub use bus::EventBus;
pub use timeline::{build_timeline, Timeline, TimelineEvent, TimelineSummary};

use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Wire shape of one event frame, shared by SSE and the bus
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Appends course events and fans them out to live subscribers
#[derive(Clone)]
pub struct EventPublisher {
    db: Database,
    bus: Arc<EventBus>,
}

impl EventPublisher {
    pub fn new(db: Database, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Emit a course event. Failures are logged, never raised: events
    /// must not decide the fate of the state machine they describe.
    pub fn emit_course_event(
        &self,
        course_id: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        match self.db.append_course_event(course_id, event_type, Some(&payload)) {
            Ok(event) => {
                let frame = EventFrame {
                    event_type: event.event_type.clone(),
                    payload,
                    timestamp: event.created_at,
                };
                self.bus
                    .publish(&EventBus::course_topic(course_id), frame);
            }
            Err(e) => {
                tracing::warn!(course_id, event_type, error = %e, "failed to record course event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CourseStatus, CourseTrigger};

    fn seed_course(db: &Database) -> i64 {
        let owner = db.create_user("o@example.com", "t").unwrap().id;
        let fiche = db.create_fiche(owner, "f", "", "", "m", &[]).unwrap();
        let thread = db.create_thread(fiche.id, None).unwrap();
        db.create_course(
            fiche.id,
            thread.id,
            CourseStatus::Running,
            CourseTrigger::Api,
            "corr",
            None,
        )
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_emit_persists_and_fans_out() {
        let db = Database::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new());
        let publisher = EventPublisher::new(db.clone(), bus.clone());
        let course_id = seed_course(&db);

        let mut rx = bus.subscribe(&EventBus::course_topic(course_id));
        publisher.emit_course_event(course_id, "tool_started", serde_json::json!({"tool": "time"}));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event_type, "tool_started");
        assert_eq!(frame.payload["tool"], "time");

        let stored = db.list_course_events(course_id, None, 10).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_emit_never_raises() {
        let db = Database::open_in_memory().unwrap();
        let publisher = EventPublisher::new(db, Arc::new(EventBus::new()));
        // Nonexistent course violates the FK; the emit still returns
        publisher.emit_course_event(999_999, "error", serde_json::json!({}));
    }
}
