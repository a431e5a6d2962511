//! Deployment and instance administration endpoints

use super::auth::AdminGate;
use super::types::{
    CreateDeploymentRequest, DeploymentStatusResponse, DryRunResponse, RollbackRequest,
};
use super::{ApiError, AppState};
use crate::deploy::{DeployError, DeployRequest};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Conflict(msg) => ApiError::Conflict(msg),
            DeployError::Validation(msg) => ApiError::BadRequest(msg),
            DeployError::NotFound(key) => ApiError::NotFound(format!("not found: {key}")),
            DeployError::Db(e) => e.into(),
        }
    }
}

pub async fn create_deployment(
    State(state): State<AppState>,
    _admin: AdminGate,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<Response, ApiError> {
    if request.image.trim().is_empty() {
        return Err(ApiError::Unprocessable("image must not be empty".to_string()));
    }
    if request.max_parallel == 0 {
        return Err(ApiError::Unprocessable(
            "max_parallel must be at least 1".to_string(),
        ));
    }
    if request.force {
        tracing::warn!("force flag ignored: concurrent deployments stay rejected");
    }

    if request.dry_run {
        let targets = state.deployer.plan()?;
        return Ok(Json(DryRunResponse {
            dry_run: true,
            count: targets.len(),
            targets: targets.into_iter().map(|i| i.subdomain).collect(),
        })
        .into_response());
    }

    let deployment = state.deployer.create(&DeployRequest {
        image: request.image,
        max_parallel: request.max_parallel,
        failure_threshold: request.failure_threshold,
    })?;

    let deployer = state.deployer.clone();
    let deploy_id = deployment.id.clone();
    tokio::spawn(async move {
        if let Err(e) = deployer.execute(&deploy_id).await {
            tracing::error!(deploy_id, error = %e, "deployment run failed");
        }
    });

    Ok(Json(deployment).into_response())
}

pub async fn list_deployments(
    State(state): State<AppState>,
    _admin: AdminGate,
) -> Result<Json<Vec<crate::db::Deployment>>, ApiError> {
    Ok(Json(state.db.list_deployments()?))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    _admin: AdminGate,
    Path(deploy_id): Path<String>,
) -> Result<Json<DeploymentStatusResponse>, ApiError> {
    let deployment = state.db.get_deployment(&deploy_id)?;
    let counts = state.db.deploy_state_counts(&deploy_id)?;
    Ok(Json(DeploymentStatusResponse {
        deployment: serde_json::to_value(deployment).unwrap_or(serde_json::Value::Null),
        counts,
    }))
}

pub async fn rollback_deployment(
    State(state): State<AppState>,
    _admin: AdminGate,
    Path(deploy_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<crate::db::Deployment>, ApiError> {
    if request.scope != "failed" {
        return Err(ApiError::BadRequest(format!(
            "unsupported rollback scope: {}",
            request.scope
        )));
    }

    let rollback = state.deployer.rollback(&deploy_id)?;

    let deployer = state.deployer.clone();
    let rollback_id = rollback.id.clone();
    tokio::spawn(async move {
        if let Err(e) = deployer.execute(&rollback_id).await {
            tracing::error!(deploy_id = rollback_id, error = %e, "rollback run failed");
        }
    });

    Ok(Json(rollback))
}

pub async fn deprovision_instance(
    State(state): State<AppState>,
    _admin: AdminGate,
    Path(instance_id): Path<i64>,
) -> Result<Json<crate::db::Instance>, ApiError> {
    Ok(Json(state.deployer.deprovision(instance_id)?))
}
