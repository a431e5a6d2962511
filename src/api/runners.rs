//! Runner fleet enrollment endpoints

use super::auth::{generate_token, hash_token, AdminGate};
use super::types::{
    EnrollTokenResponse, RegisterRunnerRequest, RegisterRunnerResponse, RotateSecretResponse,
};
use super::{ApiError, AppState};
use crate::db::{DbError, RunnerStatus};
use axum::extract::{Path, State};
use axum::Json;
use chrono::{Duration, Utc};

const ENROLL_TOKEN_TTL_MINUTES: i64 = 15;

pub async fn mint_enroll_token(
    State(state): State<AppState>,
    _admin: AdminGate,
) -> Result<Json<EnrollTokenResponse>, ApiError> {
    let token = generate_token();
    let expires_at = Utc::now() + Duration::minutes(ENROLL_TOKEN_TTL_MINUTES);
    state
        .db
        .create_enroll_token(&hash_token(&state.config.token_pepper, &token), expires_at)?;
    Ok(Json(EnrollTokenResponse {
        enroll_token: token,
        expires_at,
    }))
}

pub async fn register_runner(
    State(state): State<AppState>,
    Json(request): Json<RegisterRunnerRequest>,
) -> Result<Json<RegisterRunnerResponse>, ApiError> {
    // Atomic single-use consumption: of N concurrent registrations with
    // the same token exactly one passes this gate
    let token_hash = hash_token(&state.config.token_pepper, &request.enroll_token);
    if !state.db.consume_enroll_token(&token_hash)? {
        return Err(ApiError::BadRequest(
            "Invalid or expired enrollment token".to_string(),
        ));
    }

    let name = request
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("runner-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let secret = generate_token();
    let secret_hash = hash_token(&state.config.token_pepper, &secret);
    let metadata = request.metadata.unwrap_or_else(|| serde_json::json!({}));

    let runner = state
        .db
        .create_runner(&name, &request.labels, &metadata, &secret_hash)
        .map_err(|e| match e {
            DbError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::from(other),
        })?;

    Ok(Json(RegisterRunnerResponse {
        runner_id: runner.id,
        name: runner.name,
        runner_secret: secret,
    }))
}

pub async fn rotate_runner_secret(
    State(state): State<AppState>,
    _admin: AdminGate,
    Path(runner_id): Path<i64>,
) -> Result<Json<RotateSecretResponse>, ApiError> {
    let runner = state.db.get_runner(runner_id)?;

    let secret = generate_token();
    let secret_hash = hash_token(&state.config.token_pepper, &secret);
    if !state.db.rotate_runner_secret(runner.id, &secret_hash)? {
        return Err(ApiError::BadRequest(
            "cannot rotate secret for a revoked runner".to_string(),
        ));
    }

    Ok(Json(RotateSecretResponse {
        runner_id: runner.id,
        runner_secret: secret,
    }))
}

pub async fn list_runners(
    State(state): State<AppState>,
    _admin: AdminGate,
) -> Result<Json<Vec<crate::db::Runner>>, ApiError> {
    Ok(Json(state.db.list_runners()?))
}

pub async fn revoke_runner(
    State(state): State<AppState>,
    _admin: AdminGate,
    Path(runner_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let runner = state.db.get_runner(runner_id)?;
    state.db.set_runner_status(runner.id, RunnerStatus::Revoked)?;
    Ok(Json(serde_json::json!({"runner_id": runner.id, "status": "revoked"})))
}
