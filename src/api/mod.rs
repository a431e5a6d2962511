//! HTTP API
//!
//! Thin edge over the core subsystems: handlers translate between the
//! wire and the db/runner/deployer layers, and every error maps to the
//! status codes in one place.

pub mod auth;
pub mod deployments;
pub mod handlers;
pub mod runners;
pub mod sse;
pub mod types;

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::db::{Database, DbError};
use crate::deploy::RollingDeployer;
use crate::events::EventPublisher;
use crate::llm::LlmResolver;
use crate::runner::AgentRunner;
use crate::tools::ToolRegistry;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use types::ErrorResponse;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub events: EventPublisher,
    pub llms: Arc<dyn LlmResolver>,
    pub default_model: String,
    pub tools: Arc<ToolRegistry>,
    pub artifacts: ArtifactStore,
    pub deployer: Arc<RollingDeployer>,
}

impl AppState {
    /// A runner bound to the given model, if one is available
    pub fn runner(&self, model: &str) -> Option<AgentRunner> {
        let llm = self.llms.resolve(model)?;
        Some(AgentRunner::new(
            self.db.clone(),
            llm,
            self.tools.clone(),
            self.events.clone(),
        ))
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        // Concierge chat & course inbox
        .route("/api/jarvis/chat", post(handlers::chat))
        .route("/api/jarvis/courses", get(handlers::list_courses))
        .route("/api/jarvis/courses/active", get(handlers::get_active_course))
        .route("/api/jarvis/courses/:id", get(handlers::get_course_status))
        .route("/api/jarvis/courses/:id/cancel", post(handlers::cancel_course))
        .route("/api/jarvis/courses/:id/stream", get(handlers::stream_course))
        .route("/api/jarvis/courses/:id/events", get(handlers::get_course_events))
        .route(
            "/api/jarvis/courses/:id/timeline",
            get(handlers::get_course_timeline),
        )
        // Rolling deploys
        .route(
            "/api/deployments",
            post(deployments::create_deployment).get(deployments::list_deployments),
        )
        .route("/api/deployments/:id", get(deployments::get_deployment))
        .route(
            "/api/deployments/:id/rollback",
            post(deployments::rollback_deployment),
        )
        .route(
            "/api/instances/:id/deprovision",
            post(deployments::deprovision_instance),
        )
        // Runner fleet
        .route("/api/runners", get(runners::list_runners))
        .route("/api/runners/enroll-token", post(runners::mint_enroll_token))
        .route("/api/runners/register", post(runners::register_runner))
        .route(
            "/api/runners/:id/rotate-secret",
            post(runners::rotate_runner_secret),
        )
        .route("/api/runners/:id/revoke", post(runners::revoke_runner))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(entity, key) => ApiError::NotFound(format!("{entity} not found: {key}")),
            DbError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::auth::{hash_token, AdminGate, OwnerUser};
    use super::types::{ChatRequest, CreateDeploymentRequest, RegisterRunnerRequest};
    use super::*;
    use crate::db::{CommisJobStatus, CourseStatus, User};
    use crate::deploy::provisioner::{ProvisionError, Provisioner};
    use crate::dispatcher::workspace::WorkspaceConfig;
    use crate::dispatcher::{DispatcherConfig, JobDispatcher};
    use crate::events::EventBus;
    use crate::llm::{ChatResponse as LlmChatResponse, LlmClient, ToolCallRequest};
    use crate::runner::testing::ScriptedLlm;
    use crate::tools::SPAWN_COMMIS;
    use async_trait::async_trait;
    use axum::extract::{Path, State};
    use tempfile::TempDir;

    struct FixedResolver(Arc<dyn LlmClient>);

    impl LlmResolver for FixedResolver {
        fn resolve(&self, _model_id: &str) -> Option<Arc<dyn LlmClient>> {
            Some(self.0.clone())
        }
    }

    struct NullProvisioner;

    #[async_trait]
    impl Provisioner for NullProvisioner {
        async fn pull_image(&self, _image: &str) -> Result<(), ProvisionError> {
            Ok(())
        }
        async fn provision(
            &self,
            _instance: &crate::db::Instance,
            _image: &str,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
        async fn wait_for_health(
            &self,
            _instance: &crate::db::Instance,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    struct TestContext {
        state: AppState,
        _artifact_root: TempDir,
    }

    fn test_state(llm: ScriptedLlm) -> TestContext {
        let db = Database::open_in_memory().unwrap();
        let artifact_root = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(artifact_root.path()).unwrap();
        let events = EventPublisher::new(db.clone(), Arc::new(EventBus::new()));
        let config = Arc::new(Config {
            port: 0,
            db_path: ":memory:".to_string(),
            data_dir: artifact_root.path().to_path_buf(),
            admin_token: Some("admin-secret".to_string()),
            token_pepper: "pepper".to_string(),
            credentials_key: None,
            mcp_command_allowlist: Vec::new(),
            max_concurrent_jobs: 4,
            dispatch_interval_ms: 50,
            job_timeout_secs: 10,
            provisioner_url: None,
            dev_api_token: None,
        });
        let deployer = Arc::new(RollingDeployer::new(db.clone(), Arc::new(NullProvisioner)));
        let state = AppState {
            db: db.clone(),
            config,
            events,
            llms: Arc::new(FixedResolver(Arc::new(llm))),
            default_model: "scripted".to_string(),
            tools: Arc::new(ToolRegistry::new(artifacts.clone())),
            artifacts,
            deployer,
        };
        TestContext {
            state,
            _artifact_root: artifact_root,
        }
    }

    fn seed_user(state: &AppState) -> User {
        let hash = hash_token(&state.config.token_pepper, "user-token");
        state.db.create_user("user@example.com", &hash).unwrap()
    }

    fn dispatcher(state: &AppState) -> JobDispatcher {
        JobDispatcher::new(
            state.db.clone(),
            state.artifacts.clone(),
            state.events.clone(),
            state.llms.clone(),
            state.tools.clone(),
            WorkspaceConfig {
                hatch_path: "hatch".to_string(),
                hatch_home: std::env::temp_dir().join("hatch-test"),
                session_base_url: None,
            },
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_chat_spawn_dispatch_resume_end_to_end() {
        // Scenario: "calculate X" spawns a commis, the dispatcher runs
        // it, the resume path settles the course
        let ctx = test_state(ScriptedLlm::new(vec![
            Ok(LlmChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "cid".to_string(),
                    name: SPAWN_COMMIS.to_string(),
                    arguments: serde_json::json!({"task": "calculate X"}),
                }],
                usage: Default::default(),
            }),
            Ok(LlmChatResponse {
                content: "42".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
            Ok(LlmChatResponse {
                content: "Task completed.".to_string(),
                tool_calls: Vec::new(),
                usage: Default::default(),
            }),
        ]));
        let user = seed_user(&ctx.state);

        let response = handlers::chat(
            State(ctx.state.clone()),
            OwnerUser(user.clone()),
            axum::Json(ChatRequest {
                message: "calculate X".to_string(),
                sync: true,
            }),
        )
        .await
        .unwrap();
        let course_id = response.0.course_id;
        assert_eq!(response.0.status, "waiting");

        // The queued job carries the tool_call_id from the assistant row
        let job = ctx
            .state
            .db
            .nonterminal_job_for_course(course_id)
            .unwrap()
            .unwrap();
        assert_eq!(job.tool_call_id.as_deref(), Some("cid"));
        assert_eq!(job.status, CommisJobStatus::Queued);

        dispatcher(&ctx.state).tick().await;

        let course = ctx.state.db.get_course(course_id).unwrap();
        assert_eq!(course.status, CourseStatus::Success);

        // Snapshot exposes the result only now that it succeeded
        let snapshot = handlers::get_course_status(
            State(ctx.state.clone()),
            OwnerUser(user.clone()),
            Path(course_id),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.0.result.as_deref(), Some("Task completed."));

        // Timeline offsets are monotone and the phase events are there
        let timeline = handlers::get_course_timeline(
            State(ctx.state.clone()),
            OwnerUser(user),
            Path(course_id),
        )
        .await
        .unwrap();
        let offsets: Vec<i64> = timeline.0.events.iter().map(|e| e.offset_ms).collect();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        let phases: Vec<&str> = timeline.0.events.iter().map(|e| e.phase.as_str()).collect();
        for expected in [
            "concierge_started",
            "commis_spawned",
            "commis_started",
            "commis_complete",
            "concierge_complete",
        ] {
            assert!(phases.contains(&expected), "missing phase {expected}");
        }
    }

    #[tokio::test]
    async fn test_enrollment_token_exactly_one_winner() {
        let ctx = test_state(ScriptedLlm::new(vec![]));

        let minted = runners::mint_enroll_token(State(ctx.state.clone()), AdminGate)
            .await
            .unwrap();
        let token = minted.0.enroll_token.clone();
        assert!(token.len() >= 30);

        let mut handles = Vec::new();
        for i in 0..5 {
            let state = ctx.state.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                runners::register_runner(
                    State(state),
                    axum::Json(RegisterRunnerRequest {
                        enroll_token: token,
                        name: Some(format!("runner-{i}")),
                        labels: Vec::new(),
                        metadata: None,
                    }),
                )
                .await
            }));
        }

        let mut successes = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(response) => {
                    successes += 1;
                    assert!(response.0.runner_secret.len() >= 30);
                }
                Err(ApiError::BadRequest(msg)) => {
                    rejections += 1;
                    assert!(msg.contains("Invalid or expired"));
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(rejections, 4);
    }

    #[tokio::test]
    async fn test_rotate_secret_rehashes_and_resets() {
        let ctx = test_state(ScriptedLlm::new(vec![]));

        let minted = runners::mint_enroll_token(State(ctx.state.clone()), AdminGate)
            .await
            .unwrap();
        let registered = runners::register_runner(
            State(ctx.state.clone()),
            axum::Json(RegisterRunnerRequest {
                enroll_token: minted.0.enroll_token,
                name: Some("runner-1".to_string()),
                labels: Vec::new(),
                metadata: None,
            }),
        )
        .await
        .unwrap();
        let runner_id = registered.0.runner_id;
        let first_secret = registered.0.runner_secret;
        ctx.state
            .db
            .set_runner_status(runner_id, crate::db::RunnerStatus::Online)
            .unwrap();

        let rotated =
            runners::rotate_runner_secret(State(ctx.state.clone()), AdminGate, Path(runner_id))
                .await
                .unwrap();
        let second_secret = rotated.0.runner_secret;
        assert_ne!(first_secret, second_secret);

        let runner = ctx.state.db.get_runner(runner_id).unwrap();
        assert_eq!(runner.status, crate::db::RunnerStatus::Offline);
        assert_eq!(
            runner.secret_hash,
            hash_token(&ctx.state.config.token_pepper, &second_secret)
        );
        assert_ne!(
            runner.secret_hash,
            hash_token(&ctx.state.config.token_pepper, &first_secret)
        );

        // Revoked runners cannot rotate
        runners::revoke_runner(State(ctx.state.clone()), AdminGate, Path(runner_id))
            .await
            .unwrap();
        let denied =
            runners::rotate_runner_secret(State(ctx.state.clone()), AdminGate, Path(runner_id))
                .await;
        assert!(matches!(denied, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_deployment_validation_and_conflict() {
        let ctx = test_state(ScriptedLlm::new(vec![]));
        ctx.state.db.create_instance("a", "ct-a", 0).unwrap();

        // 422 on bad input
        let invalid = deployments::create_deployment(
            State(ctx.state.clone()),
            AdminGate,
            axum::Json(CreateDeploymentRequest {
                image: String::new(),
                max_parallel: 5,
                failure_threshold: 3,
                dry_run: false,
                force: false,
            }),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::Unprocessable(_))));

        // Dry run mutates nothing
        let dry = deployments::create_deployment(
            State(ctx.state.clone()),
            AdminGate,
            axum::Json(CreateDeploymentRequest {
                image: "img:new".to_string(),
                max_parallel: 5,
                failure_threshold: 3,
                dry_run: true,
                force: false,
            }),
        )
        .await;
        assert!(dry.is_ok());
        assert!(ctx.state.db.list_deployments().unwrap().is_empty());

        // Create, then concurrent create conflicts even with force
        let deployment = ctx
            .state
            .deployer
            .create(&crate::deploy::DeployRequest {
                image: "img:new".to_string(),
                max_parallel: 5,
                failure_threshold: 3,
            })
            .unwrap();
        let conflict = deployments::create_deployment(
            State(ctx.state.clone()),
            AdminGate,
            axum::Json(CreateDeploymentRequest {
                image: "img:other".to_string(),
                max_parallel: 5,
                failure_threshold: 3,
                dry_run: false,
                force: true,
            }),
        )
        .await;
        assert!(matches!(conflict, Err(ApiError::Conflict(_))));
        let _ = deployment;
    }

    #[tokio::test]
    async fn test_course_endpoints_are_owner_scoped() {
        let ctx = test_state(ScriptedLlm::new(vec![Ok(LlmChatResponse {
            content: "hello".to_string(),
            tool_calls: Vec::new(),
            usage: Default::default(),
        })]));
        let owner = seed_user(&ctx.state);
        let stranger_hash = hash_token(&ctx.state.config.token_pepper, "other-token");
        let stranger = ctx
            .state
            .db
            .create_user("other@example.com", &stranger_hash)
            .unwrap();

        let response = handlers::chat(
            State(ctx.state.clone()),
            OwnerUser(owner),
            axum::Json(ChatRequest {
                message: "hi".to_string(),
                sync: true,
            }),
        )
        .await
        .unwrap();

        let denied = handlers::get_course_status(
            State(ctx.state.clone()),
            OwnerUser(stranger),
            Path(response.0.course_id),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::NotFound(_))));
    }
}
