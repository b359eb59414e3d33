use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::deletion::{ApprovalResult, CreateReport, DeletionReport};
use crate::errors::{AppError, AppResult};
use crate::middleware::auth::{bearer_token, Actor, SCOPE_READ, SCOPE_WRITE};
use crate::models::deletion::Resource;

use super::AppState;

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateDeletionBody {
    /// Approver ids. Defaults to the environment's members.
    pub approvers: Option<Vec<String>>,
    pub backoff_secs: Option<u64>,
}

// ── Helpers ──────────────────────────────────────────────────

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    project_id: &str,
    environment_id: &str,
    scope: &str,
) -> AppResult<Actor> {
    let actor = state.auth.authenticate(bearer_token(headers)?).await?;
    actor.authorize(project_id, environment_id, scope)?;
    Ok(actor)
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/v1/project/:project_id/environment/:environment_id/deletion_request
pub async fn create_deletion_request(
    State(state): State<Arc<AppState>>,
    Path((project_id, environment_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<CreateDeletionBody>>,
) -> AppResult<(StatusCode, Json<CreateReport>)> {
    let actor = authorize(&state, &headers, &project_id, &environment_id, SCOPE_WRITE).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let resource = Resource::environment(project_id, environment_id);

    let approvers = match body.approvers {
        Some(approvers) => approvers,
        None => state
            .directory
            .approvers_for(&resource)
            .await
            .map_err(|e| AppError::Internal(e.context("listing approvers")))?,
    };
    let backoff = body
        .backoff_secs
        .map(Duration::from_secs)
        .unwrap_or(state.default_backoff);

    let report = state
        .coordinator
        .create_deletion_request(&actor.id, &resource, approvers, backoff)
        .await?;

    let status = if report.deleted_immediately {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(report)))
}

/// GET /api/v1/project/:project_id/environment/:environment_id/deletion_request/:id
pub async fn get_deletion_request(
    State(state): State<Arc<AppState>>,
    Path((project_id, environment_id, id)): Path<(String, String, Uuid)>,
    headers: HeaderMap,
) -> AppResult<Json<DeletionReport>> {
    authorize(&state, &headers, &project_id, &environment_id, SCOPE_READ).await?;
    let scope = Resource::environment(project_id, environment_id).scope();
    Ok(Json(state.coordinator.get_deletion_request(&scope, id).await?))
}

/// POST .../deletion_request/:id/confirmation/:code
pub async fn approve_deletion_confirmation(
    State(state): State<Arc<AppState>>,
    Path((project_id, environment_id, id, code)): Path<(String, String, Uuid, String)>,
    headers: HeaderMap,
) -> AppResult<Json<ApprovalResult>> {
    let actor = authorize(&state, &headers, &project_id, &environment_id, SCOPE_WRITE).await?;
    let scope = Resource::environment(project_id, environment_id).scope();
    let result = state
        .coordinator
        .approve_deletion_confirmation(&actor.id, &scope, id, &code)
        .await?;
    Ok(Json(result))
}

/// POST .../deletion_request/:id/rejection/:code
pub async fn reject_deletion_confirmation(
    State(state): State<Arc<AppState>>,
    Path((project_id, environment_id, id, code)): Path<(String, String, Uuid, String)>,
    headers: HeaderMap,
) -> AppResult<Json<DeletionReport>> {
    let actor = authorize(&state, &headers, &project_id, &environment_id, SCOPE_WRITE).await?;
    let scope = Resource::environment(project_id, environment_id).scope();
    let report = state
        .coordinator
        .reject_deletion_confirmation(&actor.id, &scope, id, &code)
        .await?;
    Ok(Json(report))
}

/// DELETE /api/v1/project/:project_id/environment/:environment_id
pub async fn delete_environment(
    State(state): State<Arc<AppState>>,
    Path((project_id, environment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<DeletionReport>> {
    let actor = authorize(&state, &headers, &project_id, &environment_id, SCOPE_WRITE).await?;
    let resource = Resource::environment(project_id, environment_id);
    Ok(Json(
        state.coordinator.delete_environment(&actor.id, &resource).await?,
    ))
}
