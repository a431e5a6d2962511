//! Stdio MCP client pool
//!
//! Subprocess servers are pooled per `(server name, command, env hash)`
//! so concurrent turns share one child per configuration. Each
//! connection serializes full request/response cycles behind an async
//! lock; a connection that fails a liveness check is respawned on the
//! next acquire.

use crate::llm::ToolSpec;
use crate::tools::{RunContext, Tool, ToolOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_SKIP_LINES: usize = 1000;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MCP server process has exited")]
    ProcessExited,
    #[error("timeout waiting for MCP response")]
    Timeout,
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error("MCP error: {0}")]
    Server(String),
}

/// Configuration for one stdio MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl McpServerSpec {
    /// Pool key: name + command + a digest of the env map
    fn pool_key(&self) -> (String, String, String) {
        let mut hasher = Sha256::new();
        for (k, v) in &self.env {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        let env_hash = format!("{:x}", hasher.finalize());
        (self.name.clone(), self.command.clone(), env_hash)
    }
}

/// One live stdio connection to an MCP server
struct McpConnection {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    /// Serializes full request/response cycles so concurrent callers
    /// cannot read each other's responses
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl McpConnection {
    fn spawn(spec: &McpServerSpec) -> Result<Self, McpError> {
        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON line, skipping logging that leaked to stdout
    async fn read_json_line(&self) -> Result<String, McpError> {
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;
            if bytes == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(McpError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            if !trimmed.is_empty() {
                skipped += 1;
                if skipped >= MAX_SKIP_LINES {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(McpError::Server(
                        "too many non-JSON lines on stdout".to_string(),
                    ));
                }
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::ProcessExited);
        }
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_line(&request.to_string()).await?;

        let result = timeout(REQUEST_TIMEOUT, async {
            loop {
                let line = self.read_json_line().await?;
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if message.get("id").and_then(Value::as_u64) != Some(id) {
                    // Notification or stale response; skip
                    continue;
                }
                if let Some(error) = message.get("error") {
                    return Err(McpError::Server(error.to_string()));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(McpError::Timeout)
            }
        }
    }

    async fn initialize(&self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "brigade", "version": env!("CARGO_PKG_VERSION")}
            }),
        )
        .await?;
        self.write_line(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
            .await
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "failed to kill MCP server process");
        }
    }
}

/// Process-wide MCP connection pool
pub struct McpPool {
    connections: Mutex<HashMap<(String, String, String), Arc<McpConnection>>>,
    /// Commands permitted to be spawned; empty means none
    command_allowlist: Vec<String>,
}

impl McpPool {
    pub fn new(command_allowlist: Vec<String>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            command_allowlist,
        }
    }

    /// Fetch a healthy connection for the spec, respawning a dead one
    async fn acquire(&self, spec: &McpServerSpec) -> Result<Arc<McpConnection>, McpError> {
        if !self.command_allowlist.iter().any(|c| c == &spec.command) {
            return Err(McpError::CommandNotAllowed(spec.command.clone()));
        }

        let key = spec.pool_key();
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&key) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            tracing::warn!(server = %spec.name, "MCP connection lost, respawning");
            connections.remove(&key);
        }

        let connection = Arc::new(McpConnection::spawn(spec)?);
        connection.initialize().await?;
        connections.insert(key, connection.clone());
        Ok(connection)
    }

    /// List the server's tools as registry-compatible specs
    pub async fn list_tools(&self, spec: &McpServerSpec) -> Result<Vec<ToolSpec>, McpError> {
        let connection = self.acquire(spec).await?;
        let result = connection.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                Some(ToolSpec {
                    name: format!("mcp_{}_{}", spec.name, t.get("name")?.as_str()?),
                    description: t
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: t.get("inputSchema").cloned().unwrap_or(json!({})),
                })
            })
            .collect())
    }

    /// Invoke one tool on the server
    pub async fn call_tool(
        &self,
        spec: &McpServerSpec,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let connection = self.acquire(spec).await?;
        connection
            .request(
                "tools/call",
                json!({"name": tool_name, "arguments": arguments}),
            )
            .await
    }

    /// Explicit teardown for process shutdown
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, connection) in connections {
            connection.shutdown().await;
        }
    }
}

/// Adapter exposing one MCP server tool through the local registry
pub struct McpTool {
    pool: Arc<McpPool>,
    server: McpServerSpec,
    tool_name: String,
    registered_name: String,
    description: String,
    schema: Value,
}

impl McpTool {
    pub fn new(pool: Arc<McpPool>, server: McpServerSpec, spec: &ToolSpec) -> Self {
        let tool_name = spec
            .name
            .strip_prefix(&format!("mcp_{}_", server.name))
            .unwrap_or(&spec.name)
            .to_string();
        Self {
            pool,
            server,
            tool_name,
            registered_name: spec.name.clone(),
            description: spec.description.clone(),
            schema: spec.input_schema.clone(),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.registered_name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn run(&self, input: Value, _ctx: &RunContext) -> ToolOutput {
        match self.pool.call_tool(&self.server, &self.tool_name, input).await {
            Ok(result) => ToolOutput::success(result.to_string()),
            Err(e) => ToolOutput::execution_error(format!("MCP call failed: {e}")),
        }
    }
}
