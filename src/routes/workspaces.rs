use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{EntityRecord, InviteRequest};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::services::invitations::IssuedInvitation;
use crate::AppState;

/// Workspace creation, teams and the per-workspace invitation shortcuts.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workspaces).post(create_workspace))
        .route("/:workspace_id/teams", post(create_team))
        .route("/:workspace_id/invitations", post(invite_to_workspace))
        .route(
            "/:workspace_id/projects/:project_id/invitations",
            post(invite_to_project),
        )
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

async fn list_workspaces(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<Vec<EntityRecord>>> {
    Ok(Json(state.access.get_accessible_workspaces(&user.id).await?))
}

async fn create_workspace(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<NameRequest>,
) -> AppResult<(StatusCode, Json<EntityRecord>)> {
    let workspace = state
        .entities
        .create_workspace(&user.id, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn create_team(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(workspace_id): Path<String>,
    Json(request): Json<NameRequest>,
) -> AppResult<(StatusCode, Json<EntityRecord>)> {
    let team = state
        .entities
        .create_team(&user.id, &workspace_id, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(team)))
}

async fn invite_to_workspace(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(workspace_id): Path<String>,
    Json(request): Json<InviteRequest>,
) -> AppResult<(StatusCode, Json<IssuedInvitation>)> {
    let issued = state
        .invitations
        .create_workspace_invitation(&user.id, &workspace_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn invite_to_project(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((workspace_id, project_id)): Path<(String, String)>,
    Json(request): Json<InviteRequest>,
) -> AppResult<(StatusCode, Json<IssuedInvitation>)> {
    let issued = state
        .invitations
        .create_project_invitation(&user.id, &workspace_id, &project_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}
