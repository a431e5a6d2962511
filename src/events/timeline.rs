//! Timeline derivation from a course's event log
//!
//! Offsets are milliseconds from the earliest event. Phase durations are
//! derived from the first occurrence of each boundary event; a missing
//! phase yields null in the summary.

use crate::db::CourseEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Single event in a timeline with timing information
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub phase: String,
    pub timestamp: DateTime<Utc>,
    pub offset_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Timing summary for a course
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimelineSummary {
    pub total_duration_ms: i64,
    pub concierge_thinking_ms: Option<i64>,
    pub commis_execution_ms: Option<i64>,
    pub tool_execution_ms: Option<i64>,
}

/// Derived timeline for a course
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
    pub summary: TimelineSummary,
}

/// Scan the ordered event log once and derive offsets plus the summary
pub fn build_timeline(events: &[CourseEvent]) -> Timeline {
    let Some(first) = events.first() else {
        return Timeline {
            events: Vec::new(),
            summary: TimelineSummary::default(),
        };
    };

    let t0 = first.created_at;
    let mut concierge_started: Option<DateTime<Utc>> = None;
    let mut commis_spawned: Option<DateTime<Utc>> = None;
    let mut commis_complete: Option<DateTime<Utc>> = None;
    let mut first_tool: Option<DateTime<Utc>> = None;
    let mut last_tool: Option<DateTime<Utc>> = None;

    let mut timeline_events = Vec::with_capacity(events.len());
    for event in events {
        timeline_events.push(TimelineEvent {
            phase: event.event_type.clone(),
            timestamp: event.created_at,
            offset_ms: (event.created_at - t0).num_milliseconds(),
            metadata: event.payload.clone(),
        });

        match event.event_type.as_str() {
            "concierge_started" => {
                concierge_started.get_or_insert(event.created_at);
            }
            "commis_spawned" => {
                commis_spawned.get_or_insert(event.created_at);
            }
            "commis_complete" => {
                commis_complete.get_or_insert(event.created_at);
            }
            "tool_started" => {
                first_tool.get_or_insert(event.created_at);
            }
            "tool_completed" | "tool_failed" => {
                last_tool = Some(event.created_at);
            }
            _ => {}
        }
    }

    let duration = |a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>| {
        Some((b? - a?).num_milliseconds())
    };

    let last = events.last().map_or(t0, |e| e.created_at);
    let summary = TimelineSummary {
        total_duration_ms: (last - t0).num_milliseconds(),
        concierge_thinking_ms: duration(concierge_started, commis_spawned),
        commis_execution_ms: duration(commis_spawned, commis_complete),
        tool_execution_ms: duration(first_tool, last_tool),
    };

    Timeline {
        events: timeline_events,
        summary,
    }
}
