//! Brigade - multi-tenant agent control plane
//!
//! Orchestrates a hierarchy of long-lived "fiche" agents and disposable
//! "commis" workers over a durable course/job state machine, with SSE
//! progress streaming and rolling deploys of the data-plane containers.

mod api;
mod artifacts;
mod config;
mod db;
mod deploy;
mod dispatcher;
mod events;
mod llm;
mod mcp;
mod recovery;
mod runner;
mod tools;

use api::{auth, create_router, AppState};
use artifacts::ArtifactStore;
use config::Config;
use db::Database;
use deploy::{HttpProvisioner, Provisioner, RollingDeployer};
use dispatcher::workspace::WorkspaceConfig;
use dispatcher::{DispatcherConfig, JobDispatcher};
use events::{EventBus, EventPublisher};
use llm::{LlmConfig, LlmResolver, ModelRegistry};
use mcp::{McpPool, McpServerSpec, McpTool};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brigade=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    // Dev bootstrap: a usable API token without an identity system
    if let Some(token) = &config.dev_api_token {
        let hash = auth::hash_token(&config.token_pepper, token);
        if db.get_user_by_token_hash(&hash)?.is_none() {
            let user = db.create_user("dev@localhost", &hash)?;
            tracing::info!(user_id = user.id, "created dev user from BRIGADE_DEV_TOKEN");
        }
    }

    // Recover orphaned state before any dispatch loop starts
    let report = recovery::recover(&db)?;
    if !report.is_empty() {
        tracing::warn!(?report, "startup recovery applied");
    }

    let artifacts = ArtifactStore::new(&config.data_dir)?;
    let bus = Arc::new(EventBus::new());
    let events = EventPublisher::new(db.clone(), bus.clone());

    // LLM registry
    let llm_config = LlmConfig::from_env();
    let registry = Arc::new(ModelRegistry::new(&llm_config));
    if registry.has_models() {
        tracing::info!(
            models = ?registry.available_models(),
            default = %registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set ANTHROPIC_API_KEY or LLM_GATEWAY.");
    }

    // Tools, including any MCP servers configured at startup
    let mcp_pool = Arc::new(McpPool::new(config.mcp_command_allowlist.clone()));
    let mut tool_registry = tools::ToolRegistry::new(artifacts.clone());
    for server in mcp_servers_from_env() {
        match mcp_pool.list_tools(&server).await {
            Ok(specs) => {
                tracing::info!(server = %server.name, tools = specs.len(), "registered MCP server");
                for spec in &specs {
                    tool_registry.register(Arc::new(McpTool::new(
                        mcp_pool.clone(),
                        server.clone(),
                        spec,
                    )));
                }
            }
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "skipping MCP server");
            }
        }
    }
    let tool_registry = Arc::new(tool_registry);

    // Rolling deployer
    let provisioner: Arc<dyn Provisioner> = Arc::new(HttpProvisioner::new(
        config
            .provisioner_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:9800".to_string()),
    ));
    let deployer = Arc::new(RollingDeployer::new(db.clone(), provisioner));

    // Job dispatcher
    let llms: Arc<dyn LlmResolver> = registry.clone();
    let dispatcher = Arc::new(JobDispatcher::new(
        db.clone(),
        artifacts.clone(),
        events.clone(),
        llms.clone(),
        tool_registry.clone(),
        WorkspaceConfig::from_env(),
        DispatcherConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            poll_interval: Duration::from_millis(config.dispatch_interval_ms),
            default_job_timeout: Duration::from_secs(config.job_timeout_secs),
        },
    ));
    let shutdown = CancellationToken::new();
    tokio::spawn(dispatcher.run(shutdown.child_token()));

    // HTTP edge
    let state = AppState {
        db,
        config: config.clone(),
        events,
        llms,
        default_model: registry.default_model_id().to_string(),
        tools: tool_registry,
        artifacts,
        deployer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Brigade control plane listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Teardown: stop dispatch, close MCP children, drop SSE topics
    shutdown.cancel();
    mcp_pool.shutdown().await;
    bus.shutdown();
    Ok(())
}

/// MCP stdio servers configured via `BRIGADE_MCP_SERVERS` (JSON array)
fn mcp_servers_from_env() -> Vec<McpServerSpec> {
    let Ok(raw) = std::env::var("BRIGADE_MCP_SERVERS") else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(error = %e, "invalid BRIGADE_MCP_SERVERS, ignoring");
            Vec::new()
        }
    }
}
