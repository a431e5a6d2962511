//! Agent runner
//!
//! Drives the conversation loop for a single course: call the LLM,
//! execute local tool calls, persist every message, and either settle
//! the course or suspend it on a `spawn_commis` call. Suspension is an
//! explicit tagged return from the inner loop, not control flow by
//! exception; the continuation entrypoint re-enters the same loop from
//! the persisted conversation state.

pub mod commis;
pub mod resume;

#[cfg(test)]
pub mod testing;

use crate::db::{
    CommisConfig, Course, CourseStatus, Database, DbError, Fiche, FicheStatus, MessageMetadata,
    MessageRole, ToolCallEntry,
};
use crate::events::EventPublisher;
use crate::llm::{ChatMessage, ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::tools::{RunContext, ToolRegistry, SPAWN_COMMIS};
use serde_json::json;
use std::sync::Arc;

/// Marker embedded in the recent-worker context message so stale copies
/// can be identified and pruned
pub const RECENT_WORKER_CONTEXT_MARKER: &str = "worker-inbox-context";

/// How many recent commis jobs the concierge sees each turn
pub const RECENT_WORKER_HISTORY_LIMIT: u32 = 5;

/// Messages younger than this are never pruned, so a turn that just
/// injected its context cannot lose it to a concurrent turn
const MARKER_MIN_AGE_SECS: i64 = 5;

/// Upper bound on LLM round-trips per invocation
const MAX_TURNS: usize = 24;

/// How a runner invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Course settled SUCCESS
    Success,
    /// Course moved to WAITING on a spawned commis
    Suspended,
    /// Course settled FAILED; the error is recorded on the course
    Error,
    /// Course was cancelled mid-run
    Cancelled,
    /// The course was not in a runnable state; nothing was done
    Skipped,
}

/// Result of a runner invocation
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Final assistant text on success
    pub content: Option<String>,
}

impl RunOutcome {
    fn skipped() -> Self {
        Self {
            status: RunStatus::Skipped,
            content: None,
        }
    }
}

/// Tagged return from the inner turn loop
enum TurnOutcome {
    /// The model produced a final text response
    Done { content: String },
    /// A `spawn_commis` call suspended the loop
    Suspend,
    /// Operator cancellation observed between steps
    Cancelled,
}

enum RunError {
    Llm(String),
    Db(DbError),
}

impl From<DbError> for RunError {
    fn from(e: DbError) -> Self {
        RunError::Db(e)
    }
}

/// Executes concierge turns for one course at a time
pub struct AgentRunner {
    db: Database,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    events: EventPublisher,
}

impl AgentRunner {
    pub fn new(
        db: Database,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        events: EventPublisher,
    ) -> Self {
        Self {
            db,
            llm,
            tools,
            events,
        }
    }

    /// Run a course from its start. The course must be QUEUED or
    /// freshly RUNNING; anything else returns skipped.
    pub async fn run_course(&self, course_id: i64, owner_id: i64) -> RunOutcome {
        let course = match self.db.get_course(course_id) {
            Ok(c) => c,
            Err(_) => return RunOutcome::skipped(),
        };
        match course.status {
            CourseStatus::Queued => {
                let claimed = self
                    .db
                    .transition_course(course_id, &[CourseStatus::Queued], CourseStatus::Running)
                    .unwrap_or(false);
                if !claimed {
                    return RunOutcome::skipped();
                }
            }
            CourseStatus::Running => {}
            _ => return RunOutcome::skipped(),
        }

        let Ok(fiche) = self.db.get_fiche(course.fiche_id) else {
            return self.fail_course(&course, "fiche vanished").await;
        };
        let _ = self
            .db
            .set_fiche_status(fiche.id, FicheStatus::Running, None);

        self.events.emit_course_event(
            course_id,
            "concierge_started",
            json!({"correlation_id": course.correlation_id, "fiche_id": fiche.id}),
        );

        let ctx = RunContext::new(course_id, owner_id);
        self.inject_recent_worker_context(&course, owner_id);

        let outcome = self.turn_loop(&course, &fiche, &ctx).await;
        self.settle(&course, &fiche, outcome).await
    }

    /// Resume a course whose tool result just arrived. Idempotent: an
    /// already-persisted tool message for `tool_call_id` is reused
    /// rather than duplicated.
    pub async fn run_continuation(
        &self,
        course_id: i64,
        tool_call_id: &str,
        tool_result: &str,
    ) -> RunOutcome {
        let course = match self.db.get_course(course_id) {
            Ok(c) => c,
            Err(_) => return RunOutcome::skipped(),
        };
        if course.status != CourseStatus::Running {
            return RunOutcome::skipped();
        }
        let Ok(fiche) = self.db.get_fiche(course.fiche_id) else {
            return self.fail_course(&course, "fiche vanished").await;
        };

        // The paused assistant message must carry this tool_call_id
        let paired = self
            .db
            .get_messages(course.thread_id)
            .ok()
            .is_some_and(|messages| {
                messages.iter().any(|m| {
                    m.role == MessageRole::Assistant
                        && m.tool_calls().iter().any(|c| c.id == tool_call_id)
                })
            });
        if !paired {
            return self
                .fail_course(
                    &course,
                    &format!("no assistant tool call found for id {tool_call_id}"),
                )
                .await;
        }

        let already_persisted = self
            .db
            .find_tool_message(course.thread_id, tool_call_id)
            .unwrap_or(None)
            .is_some();
        if !already_persisted {
            let metadata = MessageMetadata {
                tool_call_id: Some(tool_call_id.to_string()),
                name: Some(SPAWN_COMMIS.to_string()),
                ..Default::default()
            };
            if let Err(e) =
                self.db
                    .append_message(course.thread_id, MessageRole::Tool, tool_result, Some(&metadata))
            {
                return self.fail_course(&course, &e.to_string()).await;
            }
        }

        let ctx = RunContext::new(course_id, fiche.owner_id);
        self.inject_recent_worker_context(&course, fiche.owner_id);
        let outcome = self.turn_loop(&course, &fiche, &ctx).await;
        self.settle(&course, &fiche, outcome).await
    }

    // ==================== Turn loop ====================

    async fn turn_loop(
        &self,
        course: &Course,
        fiche: &Fiche,
        ctx: &RunContext,
    ) -> Result<TurnOutcome, RunError> {
        for turn in 0..MAX_TURNS {
            if self.is_cancelled(course.id) {
                return Ok(TurnOutcome::Cancelled);
            }

            let messages = self.build_messages(course.thread_id, fiche)?;
            let mut tools = self.tools.definitions(&fiche.allowed_tools);
            tools.push(crate::tools::spawn_commis_spec());

            if turn == 0 {
                self.events
                    .emit_course_event(course.id, "concierge_thinking", json!({}));
            }

            let response = self
                .llm
                .complete(&ChatRequest {
                    messages,
                    tools,
                    max_tokens: None,
                })
                .await
                .map_err(|e: LlmError| RunError::Llm(e.message))?;

            if !response.has_tool_calls() {
                self.db.append_message(
                    course.thread_id,
                    MessageRole::Assistant,
                    &response.content,
                    None,
                )?;
                return Ok(TurnOutcome::Done {
                    content: response.content,
                });
            }

            if let Some(outcome) = self.handle_tool_calls(course, fiche, ctx, &response).await? {
                return Ok(outcome);
            }
        }
        Err(RunError::Llm(format!(
            "turn limit of {MAX_TURNS} reached without a final response"
        )))
    }

    /// Persist the assistant message and work through its tool calls.
    /// Returns Some when the loop must stop (suspend or cancel).
    async fn handle_tool_calls(
        &self,
        course: &Course,
        fiche: &Fiche,
        ctx: &RunContext,
        response: &ChatResponse,
    ) -> Result<Option<TurnOutcome>, RunError> {
        let metadata = MessageMetadata {
            tool_calls: response
                .tool_calls
                .iter()
                .map(|c| ToolCallEntry {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect(),
            ..Default::default()
        };
        let assistant_row = self.db.append_message(
            course.thread_id,
            MessageRole::Assistant,
            &response.content,
            Some(&metadata),
        )?;

        for (idx, call) in response.tool_calls.iter().enumerate() {
            if call.name == SPAWN_COMMIS {
                let dropped = response.tool_calls.len() - idx - 1;
                if dropped > 0 {
                    tracing::warn!(
                        course_id = course.id,
                        dropped,
                        "tool calls after spawn_commis are not executed"
                    );
                }
                self.spawn_commis_job(course, fiche, assistant_row.id, call)?;
                return Ok(Some(TurnOutcome::Suspend));
            }

            if self.is_cancelled(course.id) {
                return Ok(Some(TurnOutcome::Cancelled));
            }
            self.execute_local_tool(course, ctx, call).await?;
        }
        Ok(None)
    }

    async fn execute_local_tool(
        &self,
        course: &Course,
        ctx: &RunContext,
        call: &crate::llm::ToolCallRequest,
    ) -> Result<(), RunError> {
        let seq = ctx.next_seq();
        self.events.emit_course_event(
            course.id,
            "tool_started",
            json!({"tool": call.name, "seq": seq, "tool_call_id": call.id}),
        );

        let output = self
            .tools
            .execute(&call.name, call.arguments.clone(), ctx)
            .await
            .unwrap_or_else(|| {
                crate::tools::ToolOutput::validation_error(format!("unknown tool: {}", call.name))
            });

        let event_type = if output.ok { "tool_completed" } else { "tool_failed" };
        self.events.emit_course_event(
            course.id,
            event_type,
            json!({"tool": call.name, "seq": seq, "tool_call_id": call.id}),
        );

        let metadata = MessageMetadata {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            ..Default::default()
        };
        self.db.append_message(
            course.thread_id,
            MessageRole::Tool,
            &output.content,
            Some(&metadata),
        )?;
        Ok(())
    }

    /// Create the CommisJob row and move the course to WAITING
    fn spawn_commis_job(
        &self,
        course: &Course,
        fiche: &Fiche,
        assistant_message_id: i64,
        call: &crate::llm::ToolCallRequest,
    ) -> Result<(), RunError> {
        let args = &call.arguments;
        let task = args
            .get("task")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unspecified task");
        let model = args
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&fiche.model);

        let mut config: CommisConfig =
            serde_json::from_value(args.clone()).unwrap_or_default();
        config.owner_id = Some(fiche.owner_id);

        let job = self.db.create_commis_job(
            fiche.owner_id,
            task,
            model,
            Some(course.id),
            Some(&call.id),
            &config,
        )?;

        if !self.db.set_course_waiting(course.id, assistant_message_id)? {
            // Someone settled the course underneath us; the queued job
            // will fail resume with status=skipped later
            tracing::warn!(course_id = course.id, "course left running state during spawn");
        }

        self.events.emit_course_event(
            course.id,
            "commis_spawned",
            json!({
                "job_id": job.id,
                "task": task,
                "tool_call_id": call.id,
                "execution_mode": config.execution_mode,
            }),
        );
        Ok(())
    }

    // ==================== Context helpers ====================

    fn build_messages(&self, thread_id: i64, fiche: &Fiche) -> Result<Vec<ChatMessage>, RunError> {
        let mut messages = vec![ChatMessage::system(build_system_prompt(fiche))];
        for row in self.db.get_messages(thread_id)? {
            let msg = match row.role {
                MessageRole::System => ChatMessage::system(&row.content),
                MessageRole::User => ChatMessage::user(&row.content),
                MessageRole::Assistant => {
                    let tool_calls = row
                        .tool_calls()
                        .iter()
                        .map(|c| crate::llm::ToolCallRequest {
                            id: c.id.clone(),
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        })
                        .collect();
                    ChatMessage::assistant_with_tool_calls(&row.content, tool_calls)
                }
                MessageRole::Tool => ChatMessage::tool(
                    row.tool_call_id().unwrap_or_default(),
                    &row.content,
                ),
            };
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Inject a single system message listing the owner's recent commis
    /// jobs, pruning stale copies first. Best-effort throughout.
    fn inject_recent_worker_context(&self, course: &Course, owner_id: i64) {
        if let Err(e) = self.db.delete_marker_messages(
            course.thread_id,
            RECENT_WORKER_CONTEXT_MARKER,
            MARKER_MIN_AGE_SECS,
        ) {
            tracing::warn!(error = %e, "failed to prune recent-worker context");
        }

        let jobs = match self.db.recent_commis_jobs(owner_id, RECENT_WORKER_HISTORY_LIMIT) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load recent commis jobs");
                return;
            }
        };
        if jobs.is_empty() {
            return;
        }

        let mut lines = vec![format!("Worker Inbox ({RECENT_WORKER_CONTEXT_MARKER})")];
        for job in &jobs {
            lines.push(format!(
                "- Job {}: {} [{}]",
                job.id,
                job.task,
                job.status.to_string().to_uppercase()
            ));
        }
        let metadata = MessageMetadata {
            marker: Some(RECENT_WORKER_CONTEXT_MARKER.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.db.append_message(
            course.thread_id,
            MessageRole::System,
            &lines.join("\n"),
            Some(&metadata),
        ) {
            tracing::warn!(error = %e, "failed to inject recent-worker context");
        }
    }

    fn is_cancelled(&self, course_id: i64) -> bool {
        self.db
            .get_course(course_id)
            .map(|c| c.status == CourseStatus::Cancelled)
            .unwrap_or(false)
    }

    // ==================== Settlement ====================

    async fn settle(
        &self,
        course: &Course,
        fiche: &Fiche,
        outcome: Result<TurnOutcome, RunError>,
    ) -> RunOutcome {
        match outcome {
            Ok(TurnOutcome::Done { content }) => {
                let summary = truncate_summary(&content);
                let _ = self
                    .db
                    .settle_course(course.id, CourseStatus::Success, Some(&summary), None);
                let _ = self
                    .db
                    .mark_fiche_run_finished(fiche.id, FicheStatus::Idle, None);
                self.events.emit_course_event(
                    course.id,
                    "concierge_complete",
                    json!({"content": content}),
                );
                RunOutcome {
                    status: RunStatus::Success,
                    content: Some(content),
                }
            }
            Ok(TurnOutcome::Suspend) => RunOutcome {
                status: RunStatus::Suspended,
                content: None,
            },
            Ok(TurnOutcome::Cancelled) => {
                let _ = self
                    .db
                    .mark_fiche_run_finished(fiche.id, FicheStatus::Idle, None);
                self.events
                    .emit_course_event(course.id, "run_updated", json!({"status": "cancelled"}));
                RunOutcome {
                    status: RunStatus::Cancelled,
                    content: None,
                }
            }
            Err(RunError::Llm(message)) => self.fail_with_fiche(course, Some(fiche), &message).await,
            Err(RunError::Db(e)) => self.fail_with_fiche(course, Some(fiche), &e.to_string()).await,
        }
    }

    async fn fail_course(&self, course: &Course, error: &str) -> RunOutcome {
        self.fail_with_fiche(course, None, error).await
    }

    async fn fail_with_fiche(
        &self,
        course: &Course,
        fiche: Option<&Fiche>,
        error: &str,
    ) -> RunOutcome {
        let _ = self
            .db
            .settle_course(course.id, CourseStatus::Failed, None, Some(error));
        if let Some(fiche) = fiche {
            let _ = self
                .db
                .mark_fiche_run_finished(fiche.id, FicheStatus::Failed, Some(error));
        }
        self.events
            .emit_course_event(course.id, "error", json!({"message": error}));
        self.events.emit_course_event(
            course.id,
            "run_updated",
            json!({"status": "failed", "error": error}),
        );
        RunOutcome {
            status: RunStatus::Error,
            content: None,
        }
    }
}

/// System prompt assembled from fiche configuration
fn build_system_prompt(fiche: &Fiche) -> String {
    let mut prompt = fiche.system_instructions.clone();
    if !fiche.task_instructions.is_empty() {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&fiche.task_instructions);
    }
    if prompt.is_empty() {
        prompt = "You are a helpful assistant with access to tools. Use spawn_commis to \
                  delegate focused background work."
            .to_string();
    }
    prompt
}

fn truncate_summary(content: &str) -> String {
    const MAX: usize = 240;
    if content.chars().count() <= MAX {
        content.to_string()
    } else {
        let head: String = content.chars().take(MAX - 3).collect();
        format!("{head}...")
    }
}
