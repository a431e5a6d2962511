//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    api_token_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fiches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    system_instructions TEXT NOT NULL DEFAULT '',
    task_instructions TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL,
    allowed_tools TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'idle',
    last_error TEXT,
    last_run_at TEXT,
    next_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_fiches_owner ON fiches(owner_id);

CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fiche_id INTEGER NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (fiche_id) REFERENCES fiches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_threads_fiche ON threads(fiche_id);

CREATE TABLE IF NOT EXISTS thread_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_thread_messages_thread
    ON thread_messages(thread_id, id);

CREATE TABLE IF NOT EXISTS courses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fiche_id INTEGER NOT NULL,
    thread_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    trigger_kind TEXT NOT NULL DEFAULT 'api',
    correlation_id TEXT NOT NULL,
    continuation_of_course_id INTEGER,
    assistant_message_id INTEGER,
    summary TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT,

    FOREIGN KEY (fiche_id) REFERENCES fiches(id) ON DELETE CASCADE,
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_courses_fiche ON courses(fiche_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_courses_status ON courses(status);
CREATE INDEX IF NOT EXISTS idx_courses_correlation ON courses(correlation_id);

CREATE TABLE IF NOT EXISTS commis_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    task TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    concierge_course_id INTEGER,
    tool_call_id TEXT,
    commis_id TEXT,
    config TEXT NOT NULL DEFAULT '{}',
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,

    FOREIGN KEY (concierge_course_id) REFERENCES courses(id)
);

CREATE INDEX IF NOT EXISTS idx_commis_jobs_status
    ON commis_jobs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_commis_jobs_course
    ON commis_jobs(concierge_course_id);

CREATE TABLE IF NOT EXISTS runners (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'offline',
    labels TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    secret_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_seen_at TEXT
);

CREATE TABLE IF NOT EXISTS runner_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    runner_id INTEGER,
    owner_id INTEGER NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,

    FOREIGN KEY (runner_id) REFERENCES runners(id)
);

CREATE INDEX IF NOT EXISTS idx_runner_jobs_status ON runner_jobs(status);

CREATE TABLE IF NOT EXISTS enroll_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TEXT NOT NULL,
    used_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    image TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    max_parallel INTEGER NOT NULL DEFAULT 1,
    failure_threshold INTEGER NOT NULL DEFAULT 1,
    failure_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subdomain TEXT NOT NULL UNIQUE,
    container_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    deploy_ring INTEGER NOT NULL DEFAULT 0,
    deploy_state TEXT NOT NULL DEFAULT 'idle',
    current_image TEXT,
    last_healthy_image TEXT,
    deploy_id TEXT,
    deploy_error TEXT,
    last_health_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_instances_ring ON instances(deploy_ring);

CREATE TABLE IF NOT EXISTS course_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (course_id) REFERENCES courses(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_course_events_course
    ON course_events(course_id, created_at);
";

// ============================================================================
// Users
// ============================================================================

/// A tenant account
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip)]
    pub api_token_hash: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Fiches
// ============================================================================

/// Fiche status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FicheStatus {
    Idle,
    Running,
    Failed,
}

impl FicheStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" | "RUNNING" => FicheStatus::Running,
            "failed" => FicheStatus::Failed,
            _ => FicheStatus::Idle,
        }
    }
}

impl fmt::Display for FicheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FicheStatus::Idle => write!(f, "idle"),
            FicheStatus::Running => write!(f, "running"),
            FicheStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A configured agent owned by one user
#[derive(Debug, Clone, Serialize)]
pub struct Fiche {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub system_instructions: String,
    pub task_instructions: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub status: FicheStatus,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Threads & messages
// ============================================================================

/// Role of a thread message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn parse(s: &str) -> Self {
        match s {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            _ => MessageRole::User,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Conversation context for a fiche
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    pub fiche_id: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `tool_calls[]` entry on an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEntry {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Structured metadata attached to a thread message.
///
/// Assistant rows carry `tool_calls`; tool rows carry `tool_call_id` +
/// `name`; the recent-worker context message carries `marker`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.tool_call_id.is_none()
            && self.name.is_none()
            && self.marker.is_none()
    }
}

/// One row of a thread's ordered message log
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    /// Tool-call entries carried by an assistant row
    pub fn tool_calls(&self) -> &[ToolCallEntry] {
        self.metadata.as_ref().map_or(&[], |m| &m.tool_calls)
    }

    /// Pairing id carried by a tool row
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_call_id.as_deref()
    }
}

// ============================================================================
// Courses
// ============================================================================

/// Course status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Waiting,
    Deferred,
}

impl CourseStatus {
    /// Terminal = no further transition will ever occur
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CourseStatus::Success | CourseStatus::Failed | CourseStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => CourseStatus::Running,
            "success" => CourseStatus::Success,
            "failed" => CourseStatus::Failed,
            "cancelled" => CourseStatus::Cancelled,
            "waiting" => CourseStatus::Waiting,
            "deferred" => CourseStatus::Deferred,
            _ => CourseStatus::Queued,
        }
    }
}

impl fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourseStatus::Queued => write!(f, "queued"),
            CourseStatus::Running => write!(f, "running"),
            CourseStatus::Success => write!(f, "success"),
            CourseStatus::Failed => write!(f, "failed"),
            CourseStatus::Cancelled => write!(f, "cancelled"),
            CourseStatus::Waiting => write!(f, "waiting"),
            CourseStatus::Deferred => write!(f, "deferred"),
        }
    }
}

/// What started a course
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseTrigger {
    Api,
    Manual,
    Schedule,
    Continuation,
}

impl CourseTrigger {
    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => CourseTrigger::Manual,
            "schedule" => CourseTrigger::Schedule,
            "continuation" => CourseTrigger::Continuation,
            _ => CourseTrigger::Api,
        }
    }
}

impl fmt::Display for CourseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourseTrigger::Api => write!(f, "api"),
            CourseTrigger::Manual => write!(f, "manual"),
            CourseTrigger::Schedule => write!(f, "schedule"),
            CourseTrigger::Continuation => write!(f, "continuation"),
        }
    }
}

/// One end-to-end execution of a fiche on a thread
#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: i64,
    pub fiche_id: i64,
    pub thread_id: i64,
    pub status: CourseStatus,
    pub trigger: CourseTrigger,
    pub correlation_id: String,
    pub continuation_of_course_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Commis jobs
// ============================================================================

/// Commis job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommisJobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
}

impl CommisJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommisJobStatus::Success | CommisJobStatus::Failed | CommisJobStatus::Timeout
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => CommisJobStatus::Running,
            "success" => CommisJobStatus::Success,
            "failed" => CommisJobStatus::Failed,
            "timeout" => CommisJobStatus::Timeout,
            _ => CommisJobStatus::Queued,
        }
    }
}

impl fmt::Display for CommisJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommisJobStatus::Queued => write!(f, "queued"),
            CommisJobStatus::Running => write!(f, "running"),
            CommisJobStatus::Success => write!(f, "success"),
            CommisJobStatus::Failed => write!(f, "failed"),
            CommisJobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// How a commis executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Standard,
    Workspace,
}

/// Per-job configuration stored as JSON on the row and mirrored into
/// the artifact `metadata.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommisConfig {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A subtask spawned by a concierge tool call
#[derive(Debug, Clone, Serialize)]
pub struct CommisJob {
    pub id: i64,
    pub owner_id: i64,
    pub task: String,
    pub model: String,
    pub status: CommisJobStatus,
    pub concierge_course_id: Option<i64>,
    pub tool_call_id: Option<String>,
    pub commis_id: Option<String>,
    pub config: CommisConfig,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Runner fleet
// ============================================================================

/// Runner job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunnerJobStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => RunnerJobStatus::Running,
            "completed" => RunnerJobStatus::Completed,
            "failed" => RunnerJobStatus::Failed,
            "cancelled" => RunnerJobStatus::Cancelled,
            _ => RunnerJobStatus::Queued,
        }
    }
}

impl fmt::Display for RunnerJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerJobStatus::Queued => write!(f, "queued"),
            RunnerJobStatus::Running => write!(f, "running"),
            RunnerJobStatus::Completed => write!(f, "completed"),
            RunnerJobStatus::Failed => write!(f, "failed"),
            RunnerJobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Command dispatched to an external runner host
#[derive(Debug, Clone, Serialize)]
pub struct RunnerJob {
    pub id: i64,
    pub runner_id: Option<i64>,
    pub owner_id: i64,
    pub command: String,
    pub status: RunnerJobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Runner host status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Offline,
    Online,
    Busy,
    Revoked,
}

impl RunnerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => RunnerStatus::Online,
            "busy" => RunnerStatus::Busy,
            "revoked" => RunnerStatus::Revoked,
            _ => RunnerStatus::Offline,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Offline => write!(f, "offline"),
            RunnerStatus::Online => write!(f, "online"),
            RunnerStatus::Busy => write!(f, "busy"),
            RunnerStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// An enrolled external runner host
#[derive(Debug, Clone, Serialize)]
pub struct Runner {
    pub id: i64,
    pub name: String,
    pub status: RunnerStatus,
    pub labels: Vec<String>,
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// A single-use runner enrollment token (stored hashed)
#[derive(Debug, Clone)]
pub struct EnrollToken {
    pub id: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Deployments & instances
// ============================================================================

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl DeploymentStatus {
    /// While true, no other deployment (or rollback) may start
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending | DeploymentStatus::InProgress | DeploymentStatus::Paused
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => DeploymentStatus::InProgress,
            "paused" => DeploymentStatus::Paused,
            "completed" => DeploymentStatus::Completed,
            "failed" => DeploymentStatus::Failed,
            _ => DeploymentStatus::Pending,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::InProgress => write!(f, "in_progress"),
            DeploymentStatus::Paused => write!(f, "paused"),
            DeploymentStatus::Completed => write!(f, "completed"),
            DeploymentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A rollout of a container image across instances
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: String,
    pub image: String,
    pub status: DeploymentStatus,
    pub max_parallel: u32,
    pub failure_threshold: u32,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Failed,
    Deprovisioning,
}

impl InstanceStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "failed" => InstanceStatus::Failed,
            "deprovisioning" => InstanceStatus::Deprovisioning,
            _ => InstanceStatus::Active,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Active => write!(f, "active"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Deprovisioning => write!(f, "deprovisioning"),
        }
    }
}

/// Per-deployment progress of a single instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Idle,
    Pending,
    Deploying,
    Succeeded,
    Failed,
    RolledBack,
    Skipped,
}

impl DeployState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => DeployState::Pending,
            "deploying" => DeployState::Deploying,
            "succeeded" => DeployState::Succeeded,
            "failed" => DeployState::Failed,
            "rolled_back" => DeployState::RolledBack,
            "skipped" => DeployState::Skipped,
            _ => DeployState::Idle,
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployState::Idle => write!(f, "idle"),
            DeployState::Pending => write!(f, "pending"),
            DeployState::Deploying => write!(f, "deploying"),
            DeployState::Succeeded => write!(f, "succeeded"),
            DeployState::Failed => write!(f, "failed"),
            DeployState::RolledBack => write!(f, "rolled_back"),
            DeployState::Skipped => write!(f, "skipped"),
        }
    }
}

/// A data-plane container hosting a tenant
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: i64,
    pub subdomain: String,
    pub container_name: String,
    pub status: InstanceStatus,
    pub deploy_ring: i64,
    pub deploy_state: DeployState,
    pub current_image: Option<String>,
    pub last_healthy_image: Option<String>,
    pub deploy_id: Option<String>,
    pub deploy_error: Option<String>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Course events
// ============================================================================

/// Typed, timestamped record associated with a course
#[derive(Debug, Clone, Serialize)]
pub struct CourseEvent {
    pub id: i64,
    pub course_id: i64,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
