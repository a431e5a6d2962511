//! Workspace execution mode
//!
//! Clones the job's git repo into a per-job temp directory, optionally
//! seeds a prior session for the external hatch binary to resume, runs
//! the binary as a subprocess, and captures the working-tree diff plus
//! the resulting session file. Everything except the subprocess run
//! itself is best-effort.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git clone failed: {0}")]
    CloneFailed(String),
    #[error("{0} binary exited with {1}: {2}")]
    SubprocessFailed(String, i32, String),
    #[error("subprocess timed out after {0:?}")]
    Timeout(Duration),
    #[error("no parsable result in subprocess output")]
    UnparsableOutput,
}

/// Configuration for the hatch subprocess and session storage
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Path to the hatch binary
    pub hatch_path: String,
    /// Home directory the hatch binary keeps its sessions under
    pub hatch_home: PathBuf,
    /// Base URL of the session storage collaborator
    pub session_base_url: Option<String>,
}

impl WorkspaceConfig {
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            hatch_path: std::env::var("HATCH_PATH").unwrap_or_else(|_| "hatch".to_string()),
            hatch_home: std::env::var("HATCH_HOME")
                .map_or_else(|_| PathBuf::from(home).join(".hatch"), PathBuf::from),
            session_base_url: std::env::var("SESSION_STORE_URL").ok(),
        }
    }
}

/// A cloned per-job workspace; the directory is removed on drop
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Result of one hatch invocation
#[derive(Debug, Clone)]
pub struct HatchResult {
    pub output: String,
    pub session_id: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Deserialize)]
struct HatchJsonLine {
    result: Option<String>,
    session_id: Option<String>,
}

/// Clone the repo into a fresh temp directory
pub async fn setup_workspace(repo_url: &str) -> Result<Workspace, WorkspaceError> {
    let dir = TempDir::with_prefix("brigade-ws-")?;
    let output = Command::new("git")
        .args(["clone", "--depth", "1", repo_url, "."])
        .current_dir(dir.path())
        .output()
        .await?;
    if !output.status.success() {
        return Err(WorkspaceError::CloneFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(Workspace { dir })
}

/// The hatch binary stores sessions at
/// `{home}/projects/{encoded_cwd}/{session_id}.jsonl` where the cwd is
/// encoded by replacing every non-alphanumeric character (slashes and
/// underscores included) with a dash.
pub fn encode_cwd(absolute_path: &str) -> String {
    absolute_path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

fn session_dir(config: &WorkspaceConfig, workspace_path: &Path) -> PathBuf {
    config
        .hatch_home
        .join("projects")
        .join(encode_cwd(&workspace_path.to_string_lossy()))
}

/// Fetch a prior session's JSONL and place it where the hatch binary
/// expects it. Returns the session id to pass to `--resume`.
pub async fn prepare_resume_session(
    config: &WorkspaceConfig,
    workspace_path: &Path,
    session_id: &str,
) -> Result<String, String> {
    let base = config
        .session_base_url
        .as_deref()
        .ok_or("no session store configured")?;
    let url = format!("{}/sessions/{session_id}.jsonl", base.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| format!("session fetch failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("session fetch returned HTTP {}", response.status()));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| format!("session fetch read failed: {e}"))?;

    let dir = session_dir(config, workspace_path);
    std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
    std::fs::write(dir.join(format!("{session_id}.jsonl")), &body).map_err(|e| e.to_string())?;
    Ok(session_id.to_string())
}

/// Run the hatch binary over the workspace. stdout's last JSON object
/// line carries the result payload.
pub async fn run_hatch(
    config: &WorkspaceConfig,
    workspace_path: &Path,
    task: &str,
    resume_session_id: Option<&str>,
    timeout: Duration,
) -> Result<HatchResult, WorkspaceError> {
    let started = std::time::Instant::now();

    let mut command = Command::new(&config.hatch_path);
    command
        .args(["--print", "--output-format", "json", "--dangerously-skip-permissions"])
        .current_dir(workspace_path)
        .env("HOME", shell_home(config))
        .kill_on_drop(true);
    if let Some(session_id) = resume_session_id {
        command.args(["--resume", session_id]);
    }
    command.arg(task);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result?,
        Err(_) => return Err(WorkspaceError::Timeout(timeout)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        return Err(WorkspaceError::SubprocessFailed(
            config.hatch_path.clone(),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let parsed = parse_hatch_output(&stdout).ok_or(WorkspaceError::UnparsableOutput)?;
    Ok(HatchResult {
        output: parsed.result.unwrap_or_else(|| stdout.trim().to_string()),
        session_id: parsed.session_id,
        duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
    })
}

/// The hatch binary resolves its config dir from $HOME
fn shell_home(config: &WorkspaceConfig) -> PathBuf {
    config
        .hatch_home
        .parent()
        .map_or_else(|| PathBuf::from("/tmp"), Path::to_path_buf)
}

fn parse_hatch_output(stdout: &str) -> Option<HatchJsonLine> {
    stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .and_then(|line| serde_json::from_str(line.trim()).ok())
}

/// Working-tree diff of the workspace after the run
pub async fn capture_diff(workspace_path: &Path) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(["diff"])
        .current_dir(workspace_path)
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Ship the newest session JSONL produced by the run back to storage
pub async fn ship_session(
    config: &WorkspaceConfig,
    workspace_path: &Path,
    commis_id: &str,
) -> Result<(), String> {
    let base = config
        .session_base_url
        .as_deref()
        .ok_or("no session store configured")?;

    let dir = session_dir(config, workspace_path);
    let newest = std::fs::read_dir(&dir)
        .map_err(|e| format!("session dir unreadable: {e}"))?
        .flatten()
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "jsonl")
        })
        .max_by_key(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        })
        .ok_or("no session files produced")?;

    let body = std::fs::read(newest.path()).map_err(|e| e.to_string())?;
    let url = format!("{}/sessions/{commis_id}.jsonl", base.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .put(&url)
        .timeout(Duration::from_secs(30))
        .body(body)
        .send()
        .await
        .map_err(|e| format!("session ship failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("session ship returned HTTP {}", response.status()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_cwd_replaces_slashes_and_underscores() {
        assert_eq!(encode_cwd("/tmp/my_repo/work"), "-tmp-my-repo-work");
        assert_eq!(encode_cwd("/a/b-c"), "-a-b-c");
    }

    #[test]
    fn test_parse_hatch_output_takes_last_json_line() {
        let stdout = "some log line\n{\"result\": \"first\"}\n{\"result\": \"done\", \"session_id\": \"abc\"}\n";
        let parsed = parse_hatch_output(stdout).unwrap();
        assert_eq!(parsed.result.as_deref(), Some("done"));
        assert_eq!(parsed.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_hatch_output_none_when_no_json() {
        assert!(parse_hatch_output("plain text only\n").is_none());
    }

    #[tokio::test]
    async fn test_clone_failure_reported() {
        let err = setup_workspace("file:///nonexistent/repo.git")
            .await
            .unwrap_err();
        // CloneFailed when git ran and refused; Io when git is absent
        assert!(matches!(
            err,
            WorkspaceError::CloneFailed(_) | WorkspaceError::Io(_)
        ));
    }
}
