//! Concierge chat and course endpoints

use super::auth::OwnerUser;
use super::sse::{completed_stream, completion_frame, live_stream};
use super::types::{
    ChatRequest, ChatResponse, CourseEventsResponse, CourseStatusResponse, CourseSummary,
    TimelineResponse,
};
use super::{ApiError, AppState};
use crate::db::{Course, CourseStatus, CourseTrigger, MessageRole};
use crate::events::build_timeline;
use crate::runner::RunStatus;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

const CONCIERGE_FICHE_NAME: &str = "concierge";
const CONCIERGE_SYSTEM_PROMPT: &str = "You are the user's concierge: a persistent assistant \
that answers directly when you can and delegates focused work to disposable background \
workers via spawn_commis. Prefer a worker for anything slow, multi-step, or fallible.";

const SIGNAL_MAX_CHARS: usize = 240;

// ============================================================
// Chat
// ============================================================

pub async fn chat(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let model = state.default_model.clone();
    let fiche = state.db.get_or_create_fiche(
        user.id,
        CONCIERGE_FICHE_NAME,
        CONCIERGE_SYSTEM_PROMPT,
        &model,
        &[],
    )?;
    let thread = state.db.get_or_create_thread(fiche.id)?;
    state
        .db
        .append_message(thread.id, MessageRole::User, &request.message, None)?;

    let course = state.db.create_course(
        fiche.id,
        thread.id,
        CourseStatus::Running,
        CourseTrigger::Api,
        &uuid::Uuid::new_v4().to_string(),
        None,
    )?;

    let runner = state
        .runner(&fiche.model)
        .ok_or_else(|| ApiError::Internal("no LLM configured".to_string()))?;

    if request.sync {
        let outcome = runner.run_course(course.id, user.id).await;
        let settled = state.db.get_course(course.id)?;
        return Ok(Json(ChatResponse {
            course_id: course.id,
            correlation_id: course.correlation_id,
            status: settled.status.to_string(),
            result: (outcome.status == RunStatus::Success)
                .then_some(outcome.content)
                .flatten(),
        }));
    }

    let course_id = course.id;
    let owner_id = user.id;
    tokio::spawn(async move {
        runner.run_course(course_id, owner_id).await;
    });

    Ok(Json(ChatResponse {
        course_id: course.id,
        correlation_id: course.correlation_id,
        status: CourseStatus::Running.to_string(),
        result: None,
    }))
}

// ============================================================
// Course inbox
// ============================================================

#[derive(Debug, Deserialize)]
pub struct ListCoursesQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub fiche_id: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_courses(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Query(query): Query<ListCoursesQuery>,
) -> Result<Json<Vec<CourseSummary>>, ApiError> {
    let courses = state
        .db
        .list_recent_courses(user.id, query.limit, query.fiche_id)?;

    let course_ids: Vec<i64> = courses.iter().map(|(c, _)| c.id).collect();
    let thread_ids: Vec<i64> = courses.iter().map(|(c, _)| c.thread_id).collect();
    let last_events = state.db.latest_events_per_course(&course_ids)?;
    let last_messages = state.db.latest_assistant_texts(&thread_ids)?;

    let summaries = courses
        .into_iter()
        .map(|(course, fiche_name)| {
            let last_event = last_events.get(&course.id);
            let last_event_message = last_event.and_then(|e| {
                e.payload.as_ref().and_then(|p| {
                    p.get("message")
                        .or_else(|| p.get("content"))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                })
            });

            // Signal priority: summary, error, last assistant message,
            // last event payload
            let (signal, signal_source) = if let Some(summary) = &course.summary {
                (Some(summary.clone()), Some("summary"))
            } else if let Some(error) = &course.error {
                (Some(error.clone()), Some("error"))
            } else if let Some(message) = last_messages.get(&course.thread_id) {
                (Some(message.clone()), Some("last_message"))
            } else if let Some(event_message) = &last_event_message {
                (Some(event_message.clone()), Some("last_event"))
            } else {
                (None, None)
            };

            CourseSummary {
                id: course.id,
                fiche_id: course.fiche_id,
                thread_id: course.thread_id,
                fiche_name,
                status: course.status.to_string(),
                summary: course.summary.clone(),
                signal: signal.map(|s| truncate_signal(&s)),
                signal_source: signal_source.map(String::from),
                error: course.error.clone(),
                last_event_type: last_event.map(|e| e.event_type.clone()),
                last_event_at: last_event.map(|e| e.created_at),
                continuation_of_course_id: course.continuation_of_course_id,
                created_at: course.created_at,
                finished_at: course.finished_at,
            }
        })
        .collect();

    Ok(Json(summaries))
}

pub async fn get_active_course(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
) -> Result<Response, ApiError> {
    match state.db.active_course(user.id)? {
        Some(course) => {
            let snapshot = course_snapshot(&state, &course)?;
            Ok(Json(snapshot).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn get_course_status(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Path(course_id): Path<i64>,
) -> Result<Json<CourseStatusResponse>, ApiError> {
    let course = state.db.get_course_owned(course_id, user.id)?;
    Ok(Json(course_snapshot(&state, &course)?))
}

pub async fn cancel_course(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Path(course_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let course = state.db.get_course_owned(course_id, user.id)?;
    let cancelled = state.db.cancel_course(course.id)?;
    if cancelled {
        state.events.emit_course_event(
            course.id,
            "run_updated",
            serde_json::json!({"status": "cancelled"}),
        );
    }
    Ok(Json(serde_json::json!({"cancelled": cancelled})))
}

fn course_snapshot(state: &AppState, course: &Course) -> Result<CourseStatusResponse, ApiError> {
    // The result is the settled assistant text; only SUCCESS has one
    let result = if course.status == CourseStatus::Success {
        state
            .db
            .latest_assistant_texts(&[course.thread_id])?
            .remove(&course.thread_id)
    } else {
        None
    };
    Ok(CourseStatusResponse {
        id: course.id,
        status: course.status.to_string(),
        correlation_id: course.correlation_id.clone(),
        summary: course.summary.clone(),
        error: course.error.clone(),
        result,
        created_at: course.created_at,
        finished_at: course.finished_at,
    })
}

// ============================================================
// Streaming & events
// ============================================================

pub async fn stream_course(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Path(course_id): Path<i64>,
) -> Result<Response, ApiError> {
    // Subscribe before the snapshot so no frame lands in the gap
    let rx = state
        .events
        .bus()
        .subscribe(&crate::events::EventBus::course_topic(course_id));
    let course = state.db.get_course_owned(course_id, user.id)?;

    if course.status.is_terminal() {
        let result = if course.status == CourseStatus::Success {
            state
                .db
                .latest_assistant_texts(&[course.thread_id])?
                .remove(&course.thread_id)
        } else {
            None
        };
        let completion = completion_frame(course.id, course.status, result, course.error.clone());
        return Ok(completed_stream(completion, course.id).into_response());
    }

    Ok(live_stream(rx, course.id, course.status).into_response())
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub event_type: Option<String>,
    #[serde(default = "default_events_limit")]
    pub limit: u32,
}

fn default_events_limit() -> u32 {
    500
}

pub async fn get_course_events(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Path(course_id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<CourseEventsResponse>, ApiError> {
    let course = state.db.get_course_owned(course_id, user.id)?;
    let events =
        state
            .db
            .list_course_events(course.id, query.event_type.as_deref(), query.limit)?;
    let events: Vec<serde_json::Value> = events
        .into_iter()
        .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
        .collect();
    Ok(Json(CourseEventsResponse {
        course_id: course.id,
        total: events.len(),
        events,
    }))
}

pub async fn get_course_timeline(
    State(state): State<AppState>,
    OwnerUser(user): OwnerUser,
    Path(course_id): Path<i64>,
) -> Result<Json<TimelineResponse>, ApiError> {
    let course = state.db.get_course_owned(course_id, user.id)?;
    let events = state.db.list_course_events(course.id, None, 5000)?;
    let timeline = build_timeline(&events);
    Ok(Json(TimelineResponse {
        course_id: course.id,
        correlation_id: Some(course.correlation_id),
        events: timeline.events,
        summary: timeline.summary,
    }))
}

fn truncate_signal(signal: &str) -> String {
    if signal.chars().count() <= SIGNAL_MAX_CHARS {
        signal.to_string()
    } else {
        let head: String = signal.chars().take(SIGNAL_MAX_CHARS - 3).collect();
        format!("{head}...")
    }
}
