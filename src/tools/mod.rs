//! Local tool implementations
//!
//! The set of tools bound to a turn is computed from the fiche's
//! allowed list plus any MCP-registered tools; `spawn_commis` is
//! declared here but never executed locally — the runner treats it as
//! a suspension point.

mod http;
mod knowledge;
mod location;
mod time;

pub use http::HttpRequestTool;
pub use knowledge::KnowledgeSearchTool;
pub use location::GetLocationTool;
pub use time::GetTimeTool;

use crate::artifacts::ArtifactStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::llm::ToolSpec;

/// Name of the suspending tool handled by the runner
pub const SPAWN_COMMIS: &str = "spawn_commis";

/// Tool spec for `spawn_commis`, bound only to concierge turns
pub fn spawn_commis_spec() -> ToolSpec {
    ToolSpec {
        name: SPAWN_COMMIS.to_string(),
        description: "Delegate a focused task to a disposable background worker. \
                      The worker runs asynchronously; you will receive its result \
                      as this tool call's output."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "What the worker should do"},
                "model": {"type": "string", "description": "Optional model override"},
                "execution_mode": {"type": "string", "enum": ["standard", "workspace"]},
                "git_repo": {"type": "string", "description": "Repo URL for workspace mode"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["task"]
        }),
    }
}

/// Per-course execution context threaded from the request handler down
/// through every tool call
#[derive(Clone)]
pub struct RunContext {
    pub course_id: i64,
    pub owner_id: i64,
    seq: Arc<AtomicU32>,
}

impl RunContext {
    pub fn new(course_id: i64, owner_id: i64) -> Self {
        Self {
            course_id,
            owner_id,
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Monotonically increasing per-course sequence number
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Result from tool execution.
///
/// Failures are values: the envelope is persisted as the tool message
/// so the model can react, and the turn loop keeps going.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: output.into(),
        }
    }

    /// `{ok:false, error:{type, message}}` envelope
    pub fn error(error_type: &str, message: impl Into<String>) -> Self {
        let envelope = json!({
            "ok": false,
            "error": {"type": error_type, "message": message.into()}
        });
        Self {
            ok: false,
            content: envelope.to_string(),
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::error("validation_error", message)
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::error("execution_error", message)
    }
}

/// Trait for tools the runner can execute locally
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool
    async fn run(&self, input: Value, ctx: &RunContext) -> ToolOutput;
}

/// Name-keyed collection of tools; the LLM binding list is rebuilt from
/// it each turn
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Standard registry with the built-in local tools
    pub fn new(artifacts: ArtifactStore) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(GetTimeTool));
        registry.register(Arc::new(HttpRequestTool::new()));
        registry.register(Arc::new(KnowledgeSearchTool::new(artifacts)));
        registry.register(Arc::new(GetLocationTool));
        registry
    }

    /// Add or replace a tool (also used by the MCP adapter on refresh)
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Tool definitions for the LLM, filtered by the fiche's allowed
    /// list. An empty allowed list binds every registered tool.
    pub fn definitions(&self, allowed: &[String]) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| allowed.is_empty() || allowed.iter().any(|a| a == t.name()))
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Execute a tool by name. None means the name is not registered.
    pub async fn execute(&self, name: &str, input: Value, ctx: &RunContext) -> Option<ToolOutput> {
        let tool = self.tools.get(name)?;
        Some(tool.run(input, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ToolRegistry) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        (dir, ToolRegistry::new(store))
    }

    #[test]
    fn test_error_envelope_shape() {
        let out = ToolOutput::validation_error("missing credentials");
        assert!(!out.ok);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"]["type"], "validation_error");
        assert_eq!(parsed["error"]["message"], "missing credentials");
    }

    #[test]
    fn test_definitions_respect_allowed_list() {
        let (_dir, registry) = registry();

        let all = registry.definitions(&[]);
        assert!(all.iter().any(|s| s.name == "get_current_time"));
        assert!(all.iter().any(|s| s.name == "http_request"));

        let filtered = registry.definitions(&["get_current_time".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "get_current_time");
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_none() {
        let (_dir, registry) = registry();
        let ctx = RunContext::new(1, 1);
        assert!(registry.execute("no_such_tool", json!({}), &ctx).await.is_none());
    }

    #[test]
    fn test_seq_is_monotonic() {
        let ctx = RunContext::new(1, 1);
        assert_eq!(ctx.next_seq(), 1);
        assert_eq!(ctx.next_seq(), 2);
        let clone = ctx.clone();
        assert_eq!(clone.next_seq(), 3);
    }
}
