//! Server-Sent Events for course streams
//!
//! Frame contract: `event: {type}\ndata: {json}\n\n` where the json is
//! `{type, payload, timestamp}`. A `connected` frame leads, heartbeats
//! interleave every 30 seconds, and the stream closes after a terminal
//! frame. Database access is confined to the handler; nothing is held
//! while streaming.

use crate::db::CourseStatus;
use crate::events::EventFrame;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn frame_to_event(frame: &EventFrame) -> Event {
    let data = json!({
        "type": frame.event_type,
        "payload": frame.payload,
        "timestamp": frame.timestamp,
    });
    Event::default()
        .event(frame.event_type.clone())
        .data(data.to_string())
}

fn frame(event_type: &str, payload: serde_json::Value) -> EventFrame {
    EventFrame {
        event_type: event_type.to_string(),
        payload,
        timestamp: Utc::now(),
    }
}

fn is_terminal_frame(event_type: &str) -> bool {
    matches!(event_type, "concierge_complete" | "error")
}

/// The single completion frame replayed to late subscribers of a
/// settled course
pub fn completion_frame(
    course_id: i64,
    status: CourseStatus,
    result: Option<String>,
    error: Option<String>,
) -> EventFrame {
    match status {
        CourseStatus::Success => frame(
            "concierge_complete",
            json!({"course_id": course_id, "content": result}),
        ),
        CourseStatus::Cancelled => frame(
            "error",
            json!({"course_id": course_id, "message": "course was cancelled"}),
        ),
        _ => frame(
            "error",
            json!({"course_id": course_id, "message": error.unwrap_or_else(|| "course failed".to_string())}),
        ),
    }
}

/// Stream for a course that already settled: connected frame, one
/// completion frame, close.
pub fn completed_stream(
    completion: EventFrame,
    course_id: i64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connected = frame(
        "connected",
        json!({"course_id": course_id, "live": false}),
    );
    let stream = futures::stream::iter(vec![
        Ok(frame_to_event(&connected)),
        Ok(frame_to_event(&completion)),
    ]);
    Sse::new(stream)
}

/// Live stream for a running course. The caller subscribes before
/// snapshotting status so no frame lands in the gap; the writer task
/// owns the subscription and releases it when the client goes away or
/// a terminal frame passes through.
pub fn live_stream(
    mut rx: broadcast::Receiver<EventFrame>,
    course_id: i64,
    status: CourseStatus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, out_rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let connected = frame(
            "connected",
            json!({"course_id": course_id, "live": true, "status": status}),
        );
        if tx.send(Ok(frame_to_event(&connected))).await.is_err() {
            return;
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event_frame) => {
                        let terminal = is_terminal_frame(&event_frame.event_type);
                        if tx.send(Ok(frame_to_event(&event_frame))).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(course_id, skipped, "SSE subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    let beat = frame("heartbeat", json!({}));
                    if tx.send(Ok(frame_to_event(&beat))).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(out_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_frame_shapes() {
        let success = completion_frame(1, CourseStatus::Success, Some("42".to_string()), None);
        assert_eq!(success.event_type, "concierge_complete");
        assert_eq!(success.payload["content"], "42");

        let failed = completion_frame(1, CourseStatus::Failed, None, Some("boom".to_string()));
        assert_eq!(failed.event_type, "error");
        assert_eq!(failed.payload["message"], "boom");
    }

    #[test]
    fn test_terminal_frames() {
        assert!(is_terminal_frame("concierge_complete"));
        assert!(is_terminal_frame("error"));
        assert!(!is_terminal_frame("tool_started"));
        assert!(!is_terminal_frame("heartbeat"));
    }
}
