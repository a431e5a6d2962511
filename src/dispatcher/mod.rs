//! Commis job dispatcher
//!
//! A long-running cooperative loop. Each tick atomically claims queued
//! jobs (the single-statement claim in the db layer), runs each in its
//! own task, then finalizes: set terminal status, emit
//! `commis_complete`, and resume the waiting concierge. Each phase
//! opens its own database scope; no scope is ever held across the LLM
//! call or a subprocess.

pub mod workspace;

use crate::artifacts::{ArtifactStatus, ArtifactStore};
use crate::db::{CommisJob, CommisJobStatus, Database, ExecutionMode};
use crate::events::EventPublisher;
use crate::llm::LlmResolver;
use crate::runner::commis::CommisRunner;
use crate::runner::AgentRunner;
use crate::tools::ToolRegistry;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workspace::WorkspaceConfig;

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: u32,
    pub poll_interval: Duration,
    pub default_job_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_secs(2),
            default_job_timeout: Duration::from_secs(600),
        }
    }
}

/// What one job execution produced, before finalization
struct ExecutionResult {
    status: CommisJobStatus,
    error: Option<String>,
    result_text: Option<String>,
    commis_id: Option<String>,
    duration_ms: i64,
    diff_bytes: usize,
}

pub struct JobDispatcher {
    db: Database,
    artifacts: ArtifactStore,
    events: EventPublisher,
    llms: Arc<dyn LlmResolver>,
    tools: Arc<ToolRegistry>,
    workspace: WorkspaceConfig,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        artifacts: ArtifactStore,
        events: EventPublisher,
        llms: Arc<dyn LlmResolver>,
        tools: Arc<ToolRegistry>,
        workspace: WorkspaceConfig,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            artifacts,
            events,
            llms,
            tools,
            workspace,
            config,
        }
    }

    /// Poll loop; exits when the shutdown token fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            max_concurrent = self.config.max_concurrent_jobs,
            "job dispatcher started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("job dispatcher stopped");
    }

    /// One dispatch round: claim then run every claimed job to
    /// completion. Returns how many jobs were claimed.
    pub async fn tick(&self) -> usize {
        let job_ids = match self.db.claim_queued_jobs(self.config.max_concurrent_jobs) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "job claim failed");
                return 0;
            }
        };
        if job_ids.is_empty() {
            return 0;
        }
        tracing::info!(count = job_ids.len(), "claimed queued commis jobs");

        let tasks: Vec<_> = job_ids
            .iter()
            .map(|&job_id| self.process_job(job_id))
            .collect();
        futures::future::join_all(tasks).await;
        job_ids.len()
    }

    async fn process_job(&self, job_id: i64) {
        let job = match self.db.get_commis_job(job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id, error = %e, "claimed job vanished");
                return;
            }
        };

        let execution = match job.config.execution_mode {
            ExecutionMode::Standard => self.run_standard(&job).await,
            ExecutionMode::Workspace => self.run_workspace(&job).await,
        };
        self.finalize(&job, execution).await;
    }

    // ==================== Standard mode ====================

    async fn run_standard(&self, job: &CommisJob) -> ExecutionResult {
        let started = std::time::Instant::now();
        let mut config = job.config.clone();
        config.owner_id = Some(job.owner_id);

        let commis_id = match self.artifacts.create(&job.task, &config) {
            Ok(id) => id,
            Err(e) => {
                return ExecutionResult {
                    status: CommisJobStatus::Failed,
                    error: Some(format!("artifact store unavailable: {e}")),
                    result_text: None,
                    commis_id: None,
                    duration_ms: 0,
                    diff_bytes: 0,
                }
            }
        };
        let _ = self.db.set_job_commis_id(job.id, &commis_id);
        if let Err(e) = self.artifacts.start(&commis_id) {
            tracing::warn!(job_id = job.id, error = %e, "failed to mark commis started");
        }
        self.emit_commis_started(job, &commis_id);

        let Some(llm) = self.llms.resolve(&job.model) else {
            let error = format!("no model available: {}", job.model);
            let _ = self
                .artifacts
                .complete(&commis_id, ArtifactStatus::Failed, Some(&error));
            return ExecutionResult {
                status: CommisJobStatus::Failed,
                error: Some(error),
                result_text: None,
                commis_id: Some(commis_id),
                duration_ms: elapsed_ms(started),
                diff_bytes: 0,
            };
        };

        let runner = CommisRunner::new(
            llm,
            self.tools.clone(),
            self.artifacts.clone(),
            self.events.clone(),
        );
        let timeout = self.job_timeout(job);
        let outcome = tokio::time::timeout(timeout, runner.run(job, &commis_id)).await;

        match outcome {
            Ok(Ok(result_text)) => {
                let text = if result_text.is_empty() {
                    "(No output)".to_string()
                } else {
                    result_text
                };
                if let Err(e) = self.artifacts.save_result(&commis_id, &text) {
                    tracing::warn!(job_id = job.id, error = %e, "failed to save result");
                }
                let _ = self.artifacts.complete(&commis_id, ArtifactStatus::Success, None);
                self.derive_summary(&commis_id, &text);
                ExecutionResult {
                    status: CommisJobStatus::Success,
                    error: None,
                    result_text: Some(text),
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                }
            }
            Ok(Err(error)) => {
                let _ = self
                    .artifacts
                    .complete(&commis_id, ArtifactStatus::Failed, Some(&error));
                ExecutionResult {
                    status: CommisJobStatus::Failed,
                    error: Some(error),
                    result_text: None,
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                }
            }
            Err(_) => {
                let error = format!("commis timed out after {}s", timeout.as_secs());
                let _ = self
                    .artifacts
                    .complete(&commis_id, ArtifactStatus::Timeout, Some(&error));
                ExecutionResult {
                    status: CommisJobStatus::Timeout,
                    error: Some(error),
                    result_text: None,
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                }
            }
        }
    }

    // ==================== Workspace mode ====================

    async fn run_workspace(&self, job: &CommisJob) -> ExecutionResult {
        let started = std::time::Instant::now();
        let commis_id = format!("ws-{}-{}", job.id, random_hex(8));
        let _ = self.db.set_job_commis_id(job.id, &commis_id);

        let Some(git_repo) = job.config.git_repo.clone() else {
            return ExecutionResult {
                status: CommisJobStatus::Failed,
                error: Some("Workspace execution requires git_repo in job config".to_string()),
                result_text: None,
                commis_id: Some(commis_id),
                duration_ms: 0,
                diff_bytes: 0,
            };
        };

        // Artifact tracking is best-effort in workspace mode
        let mut config = job.config.clone();
        config.owner_id = Some(job.owner_id);
        let artifacts_ok = match self.artifacts.create_with_id(&job.task, &config, &commis_id) {
            Ok(_) => {
                let _ = self.artifacts.start(&commis_id);
                true
            }
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "continuing without artifact store");
                false
            }
        };
        self.emit_commis_started(job, &commis_id);

        let ws = match workspace::setup_workspace(&git_repo).await {
            Ok(ws) => ws,
            Err(e) => {
                let error = e.to_string();
                if artifacts_ok {
                    let _ = self
                        .artifacts
                        .complete(&commis_id, ArtifactStatus::Failed, Some(&error));
                }
                return ExecutionResult {
                    status: CommisJobStatus::Failed,
                    error: Some(error),
                    result_text: None,
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                };
            }
        };

        // Resume preparation is best-effort; a failed fetch means a
        // fresh session
        let mut resume_id = None;
        if let Some(session_id) = &job.config.resume_session_id {
            match workspace::prepare_resume_session(&self.workspace, ws.path(), session_id).await {
                Ok(prepared) => resume_id = Some(prepared),
                Err(e) => {
                    tracing::warn!(job_id = job.id, error = %e, "session resume preparation failed");
                }
            }
        }

        let timeout = self.job_timeout(job);
        let hatch = workspace::run_hatch(
            &self.workspace,
            ws.path(),
            &job.task,
            resume_id.as_deref(),
            timeout,
        )
        .await;

        match hatch {
            Ok(result) => {
                let mut diff_bytes = 0;
                match workspace::capture_diff(ws.path()).await {
                    Ok(diff) if !diff.is_empty() => {
                        diff_bytes = diff.len();
                        if artifacts_ok {
                            let _ = self.artifacts.save_artifact(&commis_id, "diff.patch", &diff);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(job_id = job.id, error = %e, "diff capture failed");
                    }
                }
                if let Err(e) =
                    workspace::ship_session(&self.workspace, ws.path(), &commis_id).await
                {
                    tracing::warn!(job_id = job.id, error = %e, "session ship failed");
                }

                let text = if result.output.is_empty() {
                    "(No output)".to_string()
                } else {
                    result.output.clone()
                };
                if artifacts_ok {
                    let _ = self.artifacts.save_result(&commis_id, &text);
                    let _ = self.artifacts.complete(&commis_id, ArtifactStatus::Success, None);
                    self.derive_summary(&commis_id, &text);
                }
                ExecutionResult {
                    status: CommisJobStatus::Success,
                    error: None,
                    result_text: Some(text),
                    commis_id: Some(commis_id),
                    duration_ms: result.duration_ms,
                    diff_bytes,
                }
            }
            Err(workspace::WorkspaceError::Timeout(t)) => {
                let error = format!("workspace commis timed out after {}s", t.as_secs());
                if artifacts_ok {
                    let _ = self
                        .artifacts
                        .complete(&commis_id, ArtifactStatus::Timeout, Some(&error));
                }
                ExecutionResult {
                    status: CommisJobStatus::Timeout,
                    error: Some(error),
                    result_text: None,
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                }
            }
            Err(e) => {
                let error = e.to_string();
                if artifacts_ok {
                    let _ = self
                        .artifacts
                        .complete(&commis_id, ArtifactStatus::Failed, Some(&error));
                }
                ExecutionResult {
                    status: CommisJobStatus::Failed,
                    error: Some(error),
                    result_text: None,
                    commis_id: Some(commis_id),
                    duration_ms: elapsed_ms(started),
                    diff_bytes: 0,
                }
            }
        }
    }

    // ==================== Finalization ====================

    /// Settle the job row, emit `commis_complete`, then resume the
    /// concierge — each in its own scope, each failure isolated.
    async fn finalize(&self, job: &CommisJob, execution: ExecutionResult) {
        let settled = self
            .db
            .finish_commis_job(job.id, execution.status, execution.error.as_deref())
            .unwrap_or(false);
        if !settled {
            tracing::warn!(job_id = job.id, "job was not running at finalization");
        }

        if let Some(course_id) = job.concierge_course_id {
            self.events.emit_course_event(
                course_id,
                "commis_complete",
                json!({
                    "job_id": job.id,
                    "commis_id": execution.commis_id,
                    "status": execution.status,
                    "error": execution.error,
                    "duration_ms": execution.duration_ms,
                    "owner_id": job.owner_id,
                    "execution_mode": job.config.execution_mode,
                    "has_diff": execution.diff_bytes > 0,
                    "trace_id": job.config.trace_id,
                }),
            );

            self.resume_concierge(job, course_id, &execution).await;
        }
    }

    async fn resume_concierge(&self, job: &CommisJob, course_id: i64, execution: &ExecutionResult) {
        let llm = match self
            .db
            .get_course(course_id)
            .and_then(|course| self.db.get_fiche(course.fiche_id))
        {
            Ok(fiche) => self.llms.resolve(&fiche.model),
            Err(e) => {
                tracing::warn!(course_id, error = %e, "cannot resolve concierge for resume");
                return;
            }
        };
        let Some(llm) = llm else {
            tracing::warn!(course_id, "no model available to resume concierge");
            return;
        };

        let mut summary = match (&execution.result_text, &execution.error) {
            (Some(text), _) => {
                let head: String = text.chars().take(500).collect();
                format!("Worker completed: {head}")
            }
            (None, Some(error)) => format!("Worker failed: {error}"),
            (None, None) => "Worker finished with no output".to_string(),
        };
        if execution.diff_bytes > 0 {
            summary.push_str(&format!(
                "\n\n[Git diff captured: {} bytes]",
                execution.diff_bytes
            ));
        }

        let runner = AgentRunner::new(
            self.db.clone(),
            llm,
            self.tools.clone(),
            self.events.clone(),
        );
        let outcome = runner
            .resume_concierge_with_commis_result(course_id, &summary, Some(job.id))
            .await;
        tracing::info!(
            job_id = job.id,
            course_id,
            status = ?outcome.status,
            "concierge resume finished"
        );
    }

    // ==================== Helpers ====================

    fn emit_commis_started(&self, job: &CommisJob, commis_id: &str) {
        if let Some(course_id) = job.concierge_course_id {
            self.events.emit_course_event(
                course_id,
                "commis_started",
                json!({
                    "job_id": job.id,
                    "commis_id": commis_id,
                    "execution_mode": job.config.execution_mode,
                }),
            );
        }
    }

    /// First non-empty line of the result, capped, as the derived
    /// summary. Best-effort: summaries are recomputable.
    fn derive_summary(&self, commis_id: &str, result_text: &str) {
        let Some(head) = result_text.lines().find(|l| !l.trim().is_empty()) else {
            return;
        };
        let summary: String = head.trim().chars().take(200).collect();
        let meta = json!({
            "source": "result_head",
            "derived_at": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.artifacts.update_summary(commis_id, &summary, meta) {
            tracing::warn!(commis_id, error = %e, "summary derivation failed");
        }
        let metric = json!({
            "kind": "summary_derived",
            "chars": summary.len(),
        });
        if let Err(e) = self.artifacts.save_metric(commis_id, &metric) {
            tracing::debug!(commis_id, error = %e, "metric write failed");
        }
    }

    fn job_timeout(&self, job: &CommisJob) -> Duration {
        job.config
            .timeout_secs
            .map_or(self.config.default_job_timeout, Duration::from_secs)
    }
}

fn elapsed_ms(started: std::time::Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CommisConfig, CourseStatus};
    use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError, ToolCallRequest};
    use crate::runner::testing::{seed_concierge, InMemoryHarness, ScriptedLlm};
    use crate::tools::SPAWN_COMMIS;
    use async_trait::async_trait;

    struct FixedResolver(Arc<dyn LlmClient>);

    impl LlmResolver for FixedResolver {
        fn resolve(&self, _model_id: &str) -> Option<Arc<dyn LlmClient>> {
            Some(self.0.clone())
        }
    }

    struct NoneResolver;

    impl LlmResolver for NoneResolver {
        fn resolve(&self, _model_id: &str) -> Option<Arc<dyn LlmClient>> {
            None
        }
    }

    /// Client that never answers within a test's patience
    struct SleepyLlm;

    #[async_trait]
    impl LlmClient for SleepyLlm {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(LlmError::network("unreachable"))
        }

        fn model_id(&self) -> &str {
            "sleepy"
        }
    }

    fn dispatcher_for(harness: &InMemoryHarness, llms: Arc<dyn LlmResolver>) -> JobDispatcher {
        JobDispatcher::new(
            harness.db.clone(),
            harness.artifacts.clone(),
            harness.events.clone(),
            llms,
            harness.tools.clone(),
            WorkspaceConfig {
                hatch_path: "hatch".to_string(),
                hatch_home: std::env::temp_dir().join("hatch-test"),
                session_base_url: None,
            },
            DispatcherConfig {
                max_concurrent_jobs: 4,
                poll_interval: Duration::from_millis(10),
                default_job_timeout: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test]
    async fn test_standard_job_end_to_end() {
        // Script: concierge spawns, commis answers, concierge settles
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![
            Ok(ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call-1".to_string(),
                    name: SPAWN_COMMIS.to_string(),
                    arguments: serde_json::json!({"task": "calculate X"}),
                }],
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "42".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "Task completed.".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
        ]));
        let seeded = seed_concierge(&harness.db, "calculate X");
        harness
            .runner()
            .run_course(seeded.course_id, seeded.owner_id)
            .await;
        assert_eq!(
            harness.db.get_course(seeded.course_id).unwrap().status,
            CourseStatus::Waiting
        );

        let dispatcher = dispatcher_for(&harness, Arc::new(FixedResolver(harness.llm.clone())));
        let claimed = dispatcher.tick().await;
        assert_eq!(claimed, 1);

        // Job settled success with its artifact trail
        let job = harness
            .db
            .commis_jobs_with_status(CommisJobStatus::Success)
            .unwrap()
            .pop()
            .unwrap();
        let commis_id = job.commis_id.unwrap();
        assert_eq!(harness.artifacts.get_result(&commis_id).unwrap(), "42");
        let meta = harness.artifacts.get_metadata(&commis_id, None).unwrap();
        assert_eq!(meta.status, ArtifactStatus::Success);
        assert_eq!(meta.summary.as_deref(), Some("42"));

        // Concierge resumed and settled
        let course = harness.db.get_course(seeded.course_id).unwrap();
        assert_eq!(course.status, CourseStatus::Success);

        let events = harness
            .db
            .list_course_events(seeded.course_id, None, 100)
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        for expected in [
            "concierge_started",
            "commis_spawned",
            "commis_started",
            "commis_complete",
            "concierge_complete",
        ] {
            assert!(types.contains(&expected), "missing event {expected}");
        }

        // The completion payload matches the contract
        let complete = events
            .iter()
            .find(|e| e.event_type == "commis_complete")
            .unwrap();
        let payload = complete.payload.as_ref().unwrap();
        assert_eq!(payload["job_id"], job.id);
        assert_eq!(payload["status"], "success");
        assert_eq!(payload["owner_id"], seeded.owner_id);
    }

    #[tokio::test]
    async fn test_tick_claims_up_to_cap() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![
            Ok(ChatResponse {
                content: "a".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "b".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "c".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
        ]));
        let owner = harness.db.create_user("d@example.com", "t").unwrap();
        for i in 0..3 {
            harness
                .db
                .create_commis_job(
                    owner.id,
                    &format!("task {i}"),
                    "scripted",
                    None,
                    None,
                    &CommisConfig::default(),
                )
                .unwrap();
        }

        let mut dispatcher = dispatcher_for(&harness, Arc::new(FixedResolver(harness.llm.clone())));
        dispatcher.config.max_concurrent_jobs = 2;

        assert_eq!(dispatcher.tick().await, 2);
        assert_eq!(dispatcher.tick().await, 1);
        assert_eq!(dispatcher.tick().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_job_timeout() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![]));
        let owner = harness.db.create_user("t@example.com", "t").unwrap();
        let job = harness
            .db
            .create_commis_job(
                owner.id,
                "slow task",
                "sleepy",
                None,
                None,
                &CommisConfig {
                    timeout_secs: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();

        let dispatcher = dispatcher_for(&harness, Arc::new(FixedResolver(Arc::new(SleepyLlm))));
        dispatcher.tick().await;

        let settled = harness.db.get_commis_job(job.id).unwrap();
        assert_eq!(settled.status, CommisJobStatus::Timeout);
        let meta = harness
            .artifacts
            .get_metadata(&settled.commis_id.unwrap(), None)
            .unwrap();
        assert_eq!(meta.status, ArtifactStatus::Timeout);
    }

    #[tokio::test]
    async fn test_missing_model_fails_job() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![]));
        let owner = harness.db.create_user("m@example.com", "t").unwrap();
        let job = harness
            .db
            .create_commis_job(owner.id, "task", "ghost", None, None, &CommisConfig::default())
            .unwrap();

        let dispatcher = dispatcher_for(&harness, Arc::new(NoneResolver));
        dispatcher.tick().await;

        let settled = harness.db.get_commis_job(job.id).unwrap();
        assert_eq!(settled.status, CommisJobStatus::Failed);
        assert!(settled.error.unwrap().contains("no model available"));
    }

    #[tokio::test]
    async fn test_workspace_requires_git_repo() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![]));
        let owner = harness.db.create_user("w@example.com", "t").unwrap();
        let job = harness
            .db
            .create_commis_job(
                owner.id,
                "workspace task",
                "m",
                None,
                None,
                &CommisConfig {
                    execution_mode: ExecutionMode::Workspace,
                    ..Default::default()
                },
            )
            .unwrap();

        let dispatcher = dispatcher_for(&harness, Arc::new(NoneResolver));
        dispatcher.tick().await;

        let settled = harness.db.get_commis_job(job.id).unwrap();
        assert_eq!(settled.status, CommisJobStatus::Failed);
        assert!(settled.error.unwrap().contains("git_repo"));
    }
}
