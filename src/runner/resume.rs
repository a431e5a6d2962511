//! Concierge resume path
//!
//! The only way a WAITING course gets unwedged. Concurrency-safe: the
//! WAITING -> RUNNING transition is a guarded update, so of two
//! concurrent resumers exactly one proceeds and the other observes
//! `skipped`.

use super::{AgentRunner, RunOutcome, RunStatus};
use crate::db::CourseStatus;
use serde::Serialize;

/// Outcome of a resume attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStatus {
    Success,
    Suspended,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeOutcome {
    pub status: ResumeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResumeOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            status: ResumeStatus::Skipped,
            reason: Some(reason.to_string()),
        }
    }
}

impl AgentRunner {
    /// Feed a commis result back into its waiting concierge course.
    ///
    /// `job_id` selects the tool call when known; otherwise the single
    /// non-terminal job for the course supplies it.
    pub async fn resume_concierge_with_commis_result(
        &self,
        course_id: i64,
        commis_result: &str,
        job_id: Option<i64>,
    ) -> ResumeOutcome {
        let course = match self.db.get_course(course_id) {
            Ok(c) => c,
            Err(_) => return ResumeOutcome::skipped("course not found"),
        };
        if course.status != CourseStatus::Waiting {
            return ResumeOutcome::skipped("not waiting");
        }

        let tool_call_id = match self.resolve_tool_call_id(course_id, job_id) {
            Some(id) => id,
            None => {
                let outcome = self
                    .fail_course_by_id(course_id, "waiting course has no commis job to resume")
                    .await;
                return outcome_to_resume(outcome);
            }
        };

        // Serialize on the course row: exactly one resumer wins this
        let claimed = self
            .db
            .transition_course(course_id, &[CourseStatus::Waiting], CourseStatus::Running)
            .unwrap_or(false);
        if !claimed {
            return ResumeOutcome::skipped("not waiting");
        }

        let outcome = self
            .run_continuation(course_id, &tool_call_id, commis_result)
            .await;
        outcome_to_resume(outcome)
    }

    fn resolve_tool_call_id(&self, course_id: i64, job_id: Option<i64>) -> Option<String> {
        if let Some(job_id) = job_id {
            return self.db.get_commis_job(job_id).ok()?.tool_call_id;
        }
        self.db
            .nonterminal_job_for_course(course_id)
            .ok()??
            .tool_call_id
    }

    async fn fail_course_by_id(&self, course_id: i64, error: &str) -> RunOutcome {
        match self.db.get_course(course_id) {
            Ok(course) => self.fail_course(&course, error).await,
            Err(_) => RunOutcome {
                status: RunStatus::Skipped,
                content: None,
            },
        }
    }
}

fn outcome_to_resume(outcome: RunOutcome) -> ResumeOutcome {
    let status = match outcome.status {
        RunStatus::Success => ResumeStatus::Success,
        RunStatus::Suspended => ResumeStatus::Suspended,
        RunStatus::Error | RunStatus::Cancelled => ResumeStatus::Error,
        RunStatus::Skipped => ResumeStatus::Skipped,
    };
    ResumeOutcome {
        status,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{seed_concierge, InMemoryHarness, ScriptedLlm};
    use super::*;
    use crate::db::MessageRole;
    use crate::llm::{ChatResponse, ToolCallRequest};
    use crate::tools::SPAWN_COMMIS;
    use serde_json::json;
    use std::sync::Arc;

    fn spawn_then_done() -> ScriptedLlm {
        ScriptedLlm::new(vec![
            Ok(ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call-1".to_string(),
                    name: SPAWN_COMMIS.to_string(),
                    arguments: json!({"task": "calc"}),
                }],
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "Task completed.".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
        ])
    }

    #[tokio::test]
    async fn test_resume_settles_waiting_course() {
        let harness = InMemoryHarness::new(spawn_then_done());
        let seeded = seed_concierge(&harness.db, "calc");
        let runner = harness.runner();
        runner.run_course(seeded.course_id, seeded.owner_id).await;

        let outcome = runner
            .resume_concierge_with_commis_result(seeded.course_id, "Worker completed: 42", None)
            .await;
        assert_eq!(outcome.status, ResumeStatus::Success);

        let course = harness.db.get_course(seeded.course_id).unwrap();
        assert_eq!(course.status, crate::db::CourseStatus::Success);
    }

    #[tokio::test]
    async fn test_resume_non_waiting_is_skipped() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![]));
        let seeded = seed_concierge(&harness.db, "hi");

        let outcome = harness
            .runner()
            .resume_concierge_with_commis_result(seeded.course_id, "result", None)
            .await;
        assert_eq!(outcome.status, ResumeStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("not waiting"));
    }

    #[tokio::test]
    async fn test_concurrent_resume_single_winner() {
        let harness = InMemoryHarness::new(spawn_then_done());
        let seeded = seed_concierge(&harness.db, "calc");
        let runner = Arc::new(harness.runner());
        runner.run_course(seeded.course_id, seeded.owner_id).await;

        let a = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .resume_concierge_with_commis_result(seeded.course_id, "42", None)
                    .await
            })
        };
        let b = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .resume_concierge_with_commis_result(seeded.course_id, "42", None)
                    .await
            })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut statuses = vec![a.status, b.status];
        statuses.sort_by_key(|s| format!("{s:?}"));
        assert_eq!(statuses, vec![ResumeStatus::Skipped, ResumeStatus::Success]);

        // No duplicate tool messages
        let tool_count = harness
            .db
            .get_messages(seeded.thread_id)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == MessageRole::Tool && m.tool_call_id() == Some("call-1"))
            .count();
        assert_eq!(tool_count, 1);
    }

    #[tokio::test]
    async fn test_waiting_without_job_fails_course() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![]));
        let seeded = seed_concierge(&harness.db, "hi");
        // Force WAITING with no job row behind it
        harness
            .db
            .transition_course(
                seeded.course_id,
                &[crate::db::CourseStatus::Running],
                crate::db::CourseStatus::Waiting,
            )
            .unwrap();

        let outcome = harness
            .runner()
            .resume_concierge_with_commis_result(seeded.course_id, "result", None)
            .await;
        assert_eq!(outcome.status, ResumeStatus::Error);

        let course = harness.db.get_course(seeded.course_id).unwrap();
        assert_eq!(course.status, crate::db::CourseStatus::Failed);
    }
}
