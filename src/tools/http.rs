//! Outbound HTTP request tool

use super::{RunContext, Tool, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct HttpInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: Option<std::collections::HashMap<String, String>>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> String {
        "Make an HTTP request and return the status code and response body \
         (truncated to 64KB)."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "method": {"type": "string", "enum": ["GET", "POST", "PUT", "DELETE"]},
                "body": {"type": "string"},
                "headers": {"type": "object", "additionalProperties": {"type": "string"}}
            },
            "required": ["url"]
        })
    }

    async fn run(&self, input: Value, _ctx: &RunContext) -> ToolOutput {
        let input: HttpInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::validation_error(format!("invalid input: {e}")),
        };

        let method = match input.method.to_uppercase().parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return ToolOutput::validation_error(format!("unsupported method: {}", input.method))
            }
        };

        let mut request = self.client.request(method, &input.url);
        if let Some(headers) = &input.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        if let Some(body) = input.body {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return ToolOutput::execution_error(format!("request failed: {e}")),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolOutput::execution_error(format!("failed to read body: {e}")),
        };
        let truncated: String = body.chars().take(MAX_RESPONSE_BYTES).collect();

        ToolOutput::success(
            json!({
                "status": status,
                "body": truncated,
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_input_is_envelope() {
        let out = HttpRequestTool::new()
            .run(json!({"method": "GET"}), &RunContext::new(1, 1))
            .await;
        assert!(!out.ok);
        assert!(out.content.contains("validation_error"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_envelope() {
        let out = HttpRequestTool::new()
            .run(
                json!({"url": "http://127.0.0.1:1/nothing"}),
                &RunContext::new(1, 1),
            )
            .await;
        assert!(!out.ok);
        assert!(out.content.contains("execution_error"));
    }
}
