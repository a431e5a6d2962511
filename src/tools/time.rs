//! Current time tool

use super::{RunContext, Tool, ToolOutput};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> String {
        "Get the current UTC date and time.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn run(&self, _input: Value, _ctx: &RunContext) -> ToolOutput {
        let now = Utc::now();
        ToolOutput::success(
            json!({
                "iso": now.to_rfc3339(),
                "unix": now.timestamp(),
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_iso_timestamp() {
        let out = GetTimeTool.run(json!({}), &RunContext::new(1, 1)).await;
        assert!(out.ok);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert!(parsed["iso"].as_str().unwrap().contains('T'));
    }
}
