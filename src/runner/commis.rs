//! Commis turn loop (standard execution mode)
//!
//! A commis is a transient agent: its conversation lives in the
//! artifact store's thread.jsonl, not in a durable thread. The loop
//! mirrors the concierge loop minus `spawn_commis` — a commis cannot
//! spawn further workers.

use crate::artifacts::ArtifactStore;
use crate::db::CommisJob;
use crate::events::EventPublisher;
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::tools::{RunContext, ToolRegistry};
use serde_json::json;
use std::sync::Arc;

const MAX_TURNS: usize = 16;

/// Executes one commis job's conversation to completion
pub struct CommisRunner {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    artifacts: ArtifactStore,
    events: EventPublisher,
}

impl CommisRunner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        artifacts: ArtifactStore,
        events: EventPublisher,
    ) -> Self {
        Self {
            llm,
            tools,
            artifacts,
            events,
        }
    }

    /// Run the loop, persisting every message and tool output. Returns
    /// the final text, which the dispatcher writes as result.txt.
    pub async fn run(&self, job: &CommisJob, commis_id: &str) -> Result<String, String> {
        let ctx = RunContext::new(job.concierge_course_id.unwrap_or_default(), job.owner_id);
        let course_id = job.concierge_course_id;

        let system = format!(
            "You are a focused background worker. Complete this task and reply with \
             a concise final answer:\n\n{}",
            job.task
        );
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(&job.task)];
        for message in &messages {
            self.persist_message(commis_id, message);
        }

        for _ in 0..MAX_TURNS {
            let response = self
                .llm
                .complete(&ChatRequest {
                    messages: messages.clone(),
                    tools: self.tools.definitions(&[]),
                    max_tokens: None,
                })
                .await
                .map_err(|e| e.message)?;

            if !response.has_tool_calls() {
                let reply = ChatMessage::assistant(&response.content);
                self.persist_message(commis_id, &reply);
                return Ok(response.content);
            }

            let assistant = ChatMessage::assistant_with_tool_calls(
                &response.content,
                response.tool_calls.clone(),
            );
            self.persist_message(commis_id, &assistant);
            messages.push(assistant);

            for call in &response.tool_calls {
                let seq = ctx.next_seq();
                if let Some(course_id) = course_id {
                    self.events.emit_course_event(
                        course_id,
                        "tool_started",
                        json!({"tool": call.name, "seq": seq, "commis_id": commis_id}),
                    );
                }

                let output = self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &ctx)
                    .await
                    .unwrap_or_else(|| {
                        crate::tools::ToolOutput::validation_error(format!(
                            "unknown tool: {}",
                            call.name
                        ))
                    });

                if let Err(e) =
                    self.artifacts
                        .save_tool_output(commis_id, &call.name, &output.content, seq)
                {
                    tracing::warn!(commis_id, error = %e, "failed to save tool output");
                }
                if let Some(course_id) = course_id {
                    let event_type = if output.ok { "tool_completed" } else { "tool_failed" };
                    self.events.emit_course_event(
                        course_id,
                        event_type,
                        json!({"tool": call.name, "seq": seq, "commis_id": commis_id}),
                    );
                }

                let tool_message = ChatMessage::tool(&call.id, &output.content);
                self.persist_message(commis_id, &tool_message);
                messages.push(tool_message);
            }
        }
        Err(format!(
            "turn limit of {MAX_TURNS} reached without a final response"
        ))
    }

    fn persist_message(&self, commis_id: &str, message: &ChatMessage) {
        let value = serde_json::to_value(message).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.artifacts.save_message(commis_id, &value) {
            tracing::warn!(commis_id, error = %e, "failed to append thread message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{InMemoryHarness, ScriptedLlm};
    use super::*;
    use crate::db::CommisConfig;
    use crate::llm::{ChatResponse, ToolCallRequest};

    fn seed_job(harness: &InMemoryHarness) -> CommisJob {
        let owner = harness.db.create_user("c@example.com", "t").unwrap();
        harness
            .db
            .create_commis_job(
                owner.id,
                "calculate X",
                "scripted",
                None,
                None,
                &CommisConfig::default(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![Ok(ChatResponse {
            content: "42".to_string(),
            tool_calls: Vec::new(),
            usage: Default::default(),
        })]));
        let job = seed_job(&harness);
        let commis_id = harness
            .artifacts
            .create(&job.task, &job.config)
            .unwrap();

        let runner = CommisRunner::new(
            harness.llm.clone(),
            harness.tools.clone(),
            harness.artifacts.clone(),
            harness.events.clone(),
        );
        let result = runner.run(&job, &commis_id).await.unwrap();
        assert_eq!(result, "42");

        // system + user + assistant messages in the artifact thread
        let raw = harness.artifacts.read_file(&commis_id, "thread.jsonl").unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_tool_loop_saves_numbered_outputs() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![
            Ok(ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "c1".to_string(),
                    name: "get_current_time".to_string(),
                    arguments: serde_json::json!({}),
                }],
                usage: Default::default(),
            }),
            Ok(ChatResponse {
                content: "done at noon".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
        ]));
        let job = seed_job(&harness);
        let commis_id = harness.artifacts.create(&job.task, &job.config).unwrap();

        let runner = CommisRunner::new(
            harness.llm.clone(),
            harness.tools.clone(),
            harness.artifacts.clone(),
            harness.events.clone(),
        );
        runner.run(&job, &commis_id).await.unwrap();

        let output = harness
            .artifacts
            .read_file(&commis_id, "tool_calls/001_get_current_time.txt")
            .unwrap();
        assert!(output.contains("iso"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_error() {
        let harness = InMemoryHarness::new(ScriptedLlm::new(vec![Err("rate limited".to_string())]));
        let job = seed_job(&harness);
        let commis_id = harness.artifacts.create(&job.task, &job.config).unwrap();

        let runner = CommisRunner::new(
            harness.llm.clone(),
            harness.tools.clone(),
            harness.artifacts.clone(),
            harness.events.clone(),
        );
        let err = runner.run(&job, &commis_id).await.unwrap_err();
        assert!(err.contains("rate limited"));
    }
}
