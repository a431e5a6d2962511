//! Provisioner interface
//!
//! Container provisioning is a collaborator behind this trait; the
//! deployer only needs pull, provision, and health. The production
//! implementation talks to the provisioner service over HTTP. Tests
//! script outcomes per subdomain.

use crate::db::Instance;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("image pull failed: {0}")]
    PullFailed(String),
    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),
    #[error("health check failed: {0}")]
    Unhealthy(String),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Pull the image onto the data-plane host
    async fn pull_image(&self, image: &str) -> Result<(), ProvisionError>;

    /// Replace the instance's container with one running `image`
    async fn provision(&self, instance: &Instance, image: &str) -> Result<(), ProvisionError>;

    /// Block until the instance reports healthy or the deadline passes
    async fn wait_for_health(&self, instance: &Instance) -> Result<(), ProvisionError>;
}

/// HTTP client for the provisioner service
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
    health_deadline: Duration,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            health_deadline: Duration::from_secs(90),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn pull_image(&self, image: &str) -> Result<(), ProvisionError> {
        let response = self
            .client
            .post(self.url("/images/pull"))
            .json(&serde_json::json!({"image": image}))
            .send()
            .await
            .map_err(|e| ProvisionError::PullFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProvisionError::PullFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn provision(&self, instance: &Instance, image: &str) -> Result<(), ProvisionError> {
        let response = self
            .client
            .post(self.url(&format!("/instances/{}/provision", instance.subdomain)))
            .json(&serde_json::json!({
                "image": image,
                "container_name": instance.container_name,
            }))
            .send()
            .await
            .map_err(|e| ProvisionError::ProvisionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProvisionError::ProvisionFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn wait_for_health(&self, instance: &Instance) -> Result<(), ProvisionError> {
        let deadline = tokio::time::Instant::now() + self.health_deadline;
        loop {
            let healthy = self
                .client
                .get(self.url(&format!("/instances/{}/health", instance.subdomain)))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if healthy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionError::Unhealthy(format!(
                    "instance {} not healthy within {:?}",
                    instance.subdomain, self.health_deadline
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}
