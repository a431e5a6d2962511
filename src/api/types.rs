//! API request and response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to send a chat message to the concierge
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Await settlement instead of returning immediately
    #[serde(default)]
    pub sync: bool,
}

/// Response for chat: the course that will carry the work
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub course_id: i64,
    pub correlation_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One row of the course inbox with its derived signal
#[derive(Debug, Serialize)]
pub struct CourseSummary {
    pub id: i64,
    pub fiche_id: i64,
    pub thread_id: i64,
    pub fiche_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_of_course_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Course status snapshot
#[derive(Debug, Serialize)]
pub struct CourseStatusResponse {
    pub id: i64,
    pub status: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Populated only when the course settled SUCCESS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Raw course events
#[derive(Debug, Serialize)]
pub struct CourseEventsResponse {
    pub course_id: i64,
    pub events: Vec<serde_json::Value>,
    pub total: usize,
}

/// Timeline endpoint response
#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub course_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub events: Vec<crate::events::TimelineEvent>,
    pub summary: crate::events::TimelineSummary,
}

/// Request to create a deployment
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub image: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub dry_run: bool,
    /// Accepted for compatibility; never overrides the concurrency guard
    #[serde(default)]
    pub force: bool,
}

fn default_max_parallel() -> u32 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

/// Dry-run response: targets without mutation
#[derive(Debug, Serialize)]
pub struct DryRunResponse {
    pub dry_run: bool,
    pub targets: Vec<String>,
    pub count: usize,
}

/// Deployment status with per-state instance counts
#[derive(Debug, Serialize)]
pub struct DeploymentStatusResponse {
    #[serde(flatten)]
    pub deployment: serde_json::Value,
    pub counts: crate::db::DeployStateCounts,
}

/// Rollback request
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    #[serde(default = "default_rollback_scope")]
    pub scope: String,
}

fn default_rollback_scope() -> String {
    "failed".to_string()
}

/// Enrollment token mint response; the token is shown exactly once
#[derive(Debug, Serialize)]
pub struct EnrollTokenResponse {
    pub enroll_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Runner registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRunnerRequest {
    pub enroll_token: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Registration response; the secret is shown exactly once
#[derive(Debug, Serialize)]
pub struct RegisterRunnerResponse {
    pub runner_id: i64,
    pub name: String,
    pub runner_secret: String,
}

/// Secret rotation response
#[derive(Debug, Serialize)]
pub struct RotateSecretResponse {
    pub runner_id: i64,
    pub runner_secret: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
