//! Search over the owner's past commis artifacts

use super::{RunContext, Tool, ToolOutput};
use crate::artifacts::{ArtifactStore, ListFilter};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_MATCHES: usize = 25;

#[derive(Debug, Deserialize)]
struct KnowledgeInput {
    pattern: String,
    #[serde(default = "default_glob")]
    file_glob: String,
}

fn default_glob() -> String {
    "*.txt".to_string()
}

pub struct KnowledgeSearchTool {
    artifacts: ArtifactStore,
}

impl KnowledgeSearchTool {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> String {
        "Regex-search results produced by your past background workers.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regex to search for"},
                "file_glob": {"type": "string", "description": "File glob, default *.txt"}
            },
            "required": ["pattern"]
        })
    }

    async fn run(&self, input: Value, ctx: &RunContext) -> ToolOutput {
        let input: KnowledgeInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::validation_error(format!("invalid input: {e}")),
        };

        // Scope to the caller's own commis
        let owned = match self.artifacts.list(&ListFilter {
            limit: 1000,
            owner_id: Some(ctx.owner_id),
            ..Default::default()
        }) {
            Ok(entries) => entries,
            Err(e) => return ToolOutput::execution_error(format!("listing failed: {e}")),
        };
        let ids: Vec<String> = owned.into_iter().map(|m| m.commis_id).collect();
        if ids.is_empty() {
            return ToolOutput::success(json!({"matches": []}).to_string());
        }

        match self
            .artifacts
            .search(&input.pattern, &input.file_glob, Some(&ids))
        {
            Ok(mut matches) => {
                matches.truncate(MAX_MATCHES);
                ToolOutput::success(json!({ "matches": matches }).to_string())
            }
            Err(e) => ToolOutput::validation_error(format!("search failed: {e}")),
        }
    }
}
