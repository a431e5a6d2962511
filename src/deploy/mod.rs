//! Rolling deployer
//!
//! Drives one deployment across ringed instances: lower rings first,
//! cohorts of `max_parallel` within a ring, per-instance rollback on
//! health failure, and a failure budget that pauses the rollout and
//! skips the remaining instances once breached.

pub mod provisioner;

pub use provisioner::{HttpProvisioner, ProvisionError, Provisioner};

use crate::db::{
    Database, DbError, DeployState, Deployment, DeploymentStatus, Instance, InstanceStatus,
};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("deployment not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Per-instance outcome of one rollout step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceOutcome {
    Succeeded,
    RolledBack,
    Failed,
}

/// Options accepted at deployment creation
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub image: String,
    pub max_parallel: u32,
    pub failure_threshold: u32,
}

pub struct RollingDeployer {
    db: Database,
    provisioner: Arc<dyn Provisioner>,
}

impl RollingDeployer {
    pub fn new(db: Database, provisioner: Arc<dyn Provisioner>) -> Self {
        Self { db, provisioner }
    }

    /// The instances a deployment would target, without mutation
    pub fn plan(&self) -> Result<Vec<Instance>, DeployError> {
        Ok(self.db.active_instances()?)
    }

    /// Create the deployment row and link every active instance to it.
    /// Rejected while any other deployment is non-terminal; `force`
    /// deliberately has no override for that.
    pub fn create(&self, request: &DeployRequest) -> Result<Deployment, DeployError> {
        if request.max_parallel == 0 {
            return Err(DeployError::Validation(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        let deploy_id = generate_deploy_id();
        let deployment = self
            .db
            .create_deployment(
                &deploy_id,
                &request.image,
                request.max_parallel,
                request.failure_threshold,
            )
            .map_err(|e| match e {
                DbError::Conflict(msg) => DeployError::Conflict(msg),
                other => DeployError::Db(other),
            })?;

        for instance in self.db.active_instances()? {
            self.db.link_instance_to_deployment(instance.id, &deploy_id)?;
        }
        Ok(deployment)
    }

    /// Run the rollout to a terminal status. Sole mutator of the
    /// deployment once created.
    pub async fn execute(&self, deploy_id: &str) -> Result<Deployment, DeployError> {
        let deployment = self.db.get_deployment(deploy_id)?;
        self.db
            .set_deployment_status(deploy_id, DeploymentStatus::InProgress)?;

        // A pull failure dooms the whole rollout before any instance
        // is touched
        if let Err(e) = self.provisioner.pull_image(&deployment.image).await {
            tracing::error!(deploy_id, error = %e, "image pull failed");
            self.db.skip_pending_instances(deploy_id)?;
            self.db
                .set_deployment_status(deploy_id, DeploymentStatus::Failed)?;
            return Ok(self.db.get_deployment(deploy_id)?);
        }

        let mut targets: Vec<Instance> = self
            .db
            .instances_for_deployment(deploy_id)?
            .into_iter()
            .filter(|i| i.deploy_state == DeployState::Pending)
            .collect();
        targets.sort_by_key(|i| (i.deploy_ring, i.id));

        let mut failure_count = deployment.failure_count;
        let mut threshold_hit = false;
        'rings: for ring in ring_groups(&targets) {
            for cohort in ring.chunks(deployment.max_parallel.max(1) as usize) {
                let outcomes = futures::future::join_all(
                    cohort
                        .iter()
                        .map(|instance| self.deploy_single_instance(&deployment, instance)),
                )
                .await;

                for outcome in outcomes.into_iter().flatten() {
                    if outcome != InstanceOutcome::Succeeded {
                        failure_count = self.db.increment_deployment_failures(deploy_id)?;
                    }
                }
                if failure_count >= deployment.failure_threshold {
                    threshold_hit = true;
                    break 'rings;
                }
            }
        }

        if threshold_hit {
            let skipped = self.db.skip_pending_instances(deploy_id)?;
            tracing::warn!(
                deploy_id,
                skipped = skipped.len(),
                "failure threshold reached, pausing deployment"
            );
            self.db
                .set_deployment_status(deploy_id, DeploymentStatus::Paused)?;
        } else {
            self.db
                .set_deployment_status(deploy_id, DeploymentStatus::Completed)?;
        }
        Ok(self.db.get_deployment(deploy_id)?)
    }

    /// Deploy one instance: provision, health check, and on failure a
    /// rollback attempt when a distinct last-healthy image exists.
    async fn deploy_single_instance(
        &self,
        deployment: &Deployment,
        instance: &Instance,
    ) -> Option<InstanceOutcome> {
        if !self.db.begin_instance_deploy(instance.id).ok()? {
            return None;
        }

        let health = async {
            self.provisioner.provision(instance, &deployment.image).await?;
            self.provisioner.wait_for_health(instance).await
        }
        .await;

        match health {
            Ok(()) => {
                self.db
                    .mark_instance_deployed(instance.id, &deployment.image)
                    .ok()?;
                Some(InstanceOutcome::Succeeded)
            }
            Err(deploy_error) => {
                let rollback_target = instance
                    .last_healthy_image
                    .as_deref()
                    .filter(|img| *img != deployment.image);
                match rollback_target {
                    Some(old_image) => {
                        let restored = async {
                            self.provisioner.provision(instance, old_image).await?;
                            self.provisioner.wait_for_health(instance).await
                        }
                        .await;
                        if restored.is_ok() {
                            self.db
                                .mark_instance_rolled_back(instance.id, &deploy_error.to_string())
                                .ok()?;
                            Some(InstanceOutcome::RolledBack)
                        } else {
                            // Deploy and rollback both failed: the
                            // instance is down
                            self.db
                                .mark_instance_deploy_failed(
                                    instance.id,
                                    &deploy_error.to_string(),
                                    true,
                                )
                                .ok()?;
                            Some(InstanceOutcome::Failed)
                        }
                    }
                    None => {
                        self.db
                            .mark_instance_deploy_failed(
                                instance.id,
                                &deploy_error.to_string(),
                                true,
                            )
                            .ok()?;
                        Some(InstanceOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Roll a failed or paused deployment's failed instances back by
    /// creating a new deployment targeting their shared last-healthy
    /// image.
    pub fn rollback(&self, deploy_id: &str) -> Result<Deployment, DeployError> {
        let deployment = self.db.get_deployment(deploy_id).map_err(|e| match e {
            DbError::NotFound(..) => DeployError::NotFound(deploy_id.to_string()),
            other => DeployError::Db(other),
        })?;
        if !matches!(
            deployment.status,
            DeploymentStatus::Failed | DeploymentStatus::Paused
        ) {
            return Err(DeployError::Validation(format!(
                "deployment {deploy_id} is {}, only failed or paused deployments roll back",
                deployment.status
            )));
        }

        // Another live rollout (not this one) blocks the rollback
        if let Some(blocking) = self.db.blocking_deployment()? {
            if blocking.id != deploy_id {
                return Err(DeployError::Conflict(format!(
                    "deployment {} is still in progress",
                    blocking.id
                )));
            }
        }

        let failed: Vec<Instance> = self
            .db
            .instances_for_deployment(deploy_id)?
            .into_iter()
            .filter(|i| i.deploy_state == DeployState::Failed)
            .collect();
        if failed.is_empty() {
            return Err(DeployError::Validation(
                "no failed instances to roll back".to_string(),
            ));
        }

        if failed.iter().any(|i| i.last_healthy_image.is_none()) {
            return Err(DeployError::Validation(
                "some failed instances have no last healthy image".to_string(),
            ));
        }
        let mut images: Vec<&str> = failed
            .iter()
            .filter_map(|i| i.last_healthy_image.as_deref())
            .collect();
        images.sort_unstable();
        images.dedup();
        if images.len() != 1 {
            return Err(DeployError::Validation(
                "failed instances have different last_healthy_image values".to_string(),
            ));
        }
        let target_image = images[0].to_string();

        // Finalize the source deployment so the new one can start
        self.db
            .set_deployment_status(deploy_id, DeploymentStatus::Failed)?;

        let rollback_id = generate_deploy_id();
        let rollback = self
            .db
            .create_deployment(&rollback_id, &target_image, deployment.max_parallel, u32::MAX)
            .map_err(|e| match e {
                DbError::Conflict(msg) => DeployError::Conflict(msg),
                other => DeployError::Db(other),
            })?;
        for instance in &failed {
            self.db
                .link_instance_to_deployment(instance.id, &rollback_id)?;
        }
        Ok(rollback)
    }

    /// Deprovisioning is rejected while the instance is mid-rollout
    pub fn deprovision(&self, instance_id: i64) -> Result<Instance, DeployError> {
        let instance = self.db.get_instance(instance_id).map_err(|e| match e {
            DbError::NotFound(..) => DeployError::NotFound(instance_id.to_string()),
            other => DeployError::Db(other),
        })?;

        if matches!(
            instance.deploy_state,
            DeployState::Pending | DeployState::Deploying
        ) {
            if let Some(deploy_id) = &instance.deploy_id {
                let live = self
                    .db
                    .get_deployment(deploy_id)
                    .map(|d| d.status.is_blocking())
                    .unwrap_or(false);
                if live {
                    return Err(DeployError::Conflict(format!(
                        "instance {} is part of active deployment {deploy_id}",
                        instance.subdomain
                    )));
                }
            }
        }

        self.db
            .set_instance_status(instance_id, InstanceStatus::Deprovisioning)?;
        Ok(self.db.get_instance(instance_id)?)
    }
}

/// Split ring-sorted instances into per-ring groups
fn ring_groups(sorted: &[Instance]) -> Vec<Vec<Instance>> {
    let mut groups: Vec<Vec<Instance>> = Vec::new();
    for instance in sorted {
        match groups.last_mut() {
            Some(group) if group[0].deploy_ring == instance.deploy_ring => {
                group.push(instance.clone());
            }
            _ => groups.push(vec![instance.clone()]),
        }
    }
    groups
}

/// Random-suffixed deploy id; enough entropy that concurrent
/// generations do not collide
fn generate_deploy_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect()
    };
    format!("deploy-{timestamp}-{suffix}")
}
