//! Environment-driven configuration

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    /// Root of the commis artifact store
    pub data_dir: PathBuf,
    /// Token for operator endpoints (deployments, runner enrollment)
    pub admin_token: Option<String>,
    /// Server-side pepper mixed into stored token hashes
    pub token_pepper: String,
    /// Symmetric key handed to the connector-credential collaborator;
    /// the core only carries it through
    pub credentials_key: Option<String>,
    /// Commands MCP server specs are allowed to spawn
    pub mcp_command_allowlist: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub dispatch_interval_ms: u64,
    pub job_timeout_secs: u64,
    /// Base URL of the provisioner service for rolling deploys
    pub provisioner_url: Option<String>,
    /// Pre-hashed dev API token; creates a user on first boot
    pub dev_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            port: std::env::var("BRIGADE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            db_path: std::env::var("BRIGADE_DB_PATH")
                .unwrap_or_else(|_| format!("{home}/.brigade/brigade.db")),
            data_dir: std::env::var("BRIGADE_DATA_PATH")
                .map_or_else(|_| PathBuf::from(&home).join(".brigade/commis"), PathBuf::from),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            token_pepper: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "brigade-dev-secret".to_string()),
            credentials_key: std::env::var("CREDENTIALS_KEY").ok(),
            mcp_command_allowlist: std::env::var("MCP_COMMAND_ALLOWLIST")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            dispatch_interval_ms: std::env::var("DISPATCH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            job_timeout_secs: std::env::var("JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            provisioner_url: std::env::var("PROVISIONER_URL").ok(),
            dev_api_token: std::env::var("BRIGADE_DEV_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}
