use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, put},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{
    AccessInfo, AccessRequest, CreateEntity, EffectiveMember, EntityRecord, EntityRef,
    EntityType, Invitation, InvitationLinkSettings, Membership, Role, UpdateProject,
    UpdateVisibility,
};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::AppState;

/// Generic per-entity endpoints addressed as `/:kind/:id`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:kind", get(list_accessible).post(create_entity))
        .route("/:kind/:id/access", get(access_info))
        .route("/:kind/:id/visibility", put(set_visibility))
        .route("/:kind/:id/members", get(list_members).post(add_member))
        .route(
            "/:kind/:id/members/:user_id",
            patch(update_member).delete(remove_member),
        )
        .route("/:kind/:id/invitations", get(list_invitations))
        .route("/:kind/:id/link", get(active_link))
        .route("/:kind/:id/access-requests", get(list_access_requests))
}

pub fn projects_router() -> Router<Arc<AppState>> {
    Router::new().route("/:project_id", patch(update_project))
}

fn target(kind: &str, id: String) -> AppResult<EntityRef> {
    Ok(EntityRef::new(kind.parse()?, id))
}

async fn list_accessible(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(kind): Path<String>,
) -> AppResult<Json<Vec<EntityRecord>>> {
    let kind: EntityType = kind.parse()?;
    Ok(Json(state.access.get_accessible(kind, &user.id).await?))
}

async fn create_entity(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(kind): Path<String>,
    Json(input): Json<CreateEntity>,
) -> AppResult<(StatusCode, Json<EntityRecord>)> {
    let kind: EntityType = kind.parse()?;
    let record = state.entities.create_child(&user.id, kind, &input).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(project_id): Path<String>,
    Json(update): Json<UpdateProject>,
) -> AppResult<Json<EntityRecord>> {
    Ok(Json(
        state
            .entities
            .update_project(&user.id, &project_id, update)
            .await?,
    ))
}

async fn access_info(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<AccessInfo>> {
    let entity = target(&kind, id)?;
    Ok(Json(state.access.get_access_info(&entity, &user.id).await?))
}

async fn set_visibility(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Json(update): Json<UpdateVisibility>,
) -> AppResult<Json<EntityRecord>> {
    let entity = target(&kind, id)?;
    Ok(Json(
        state
            .entities
            .set_visibility(&user.id, &entity, &update)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct MembersQuery {
    /// `true` lists only rows stored on the entity itself.
    #[serde(default)]
    pub direct: bool,
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<MembersQuery>,
) -> AppResult<Json<Vec<EffectiveMember>>> {
    let entity = target(&kind, id)?;
    state.access.require_access(&entity, &user.id).await?;

    let members = if query.direct {
        state.access.list_direct_members(&entity).await?
    } else {
        state.access.list_effective_members(&entity).await?
    };
    Ok(Json(members))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    pub role: Role,
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Json(request): Json<AddMemberRequest>,
) -> AppResult<(StatusCode, Json<Membership>)> {
    let entity = target(&kind, id)?;
    let membership = state
        .members
        .add_member(&user.id, &entity, &request.user_id, request.role)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: Role,
}

async fn update_member(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id, member_id)): Path<(String, String, String)>,
    Json(request): Json<UpdateRoleRequest>,
) -> AppResult<Json<Membership>> {
    let entity = target(&kind, id)?;
    Ok(Json(
        state
            .members
            .update_member_role(&user.id, &entity, &member_id, request.role)
            .await?,
    ))
}

async fn remove_member(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id, member_id)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    let entity = target(&kind, id)?;
    state
        .members
        .remove_member(&user.id, &entity, &member_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_invitations(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<Vec<Invitation>>> {
    let entity = target(&kind, id)?;
    Ok(Json(
        state
            .invitations
            .list_for_target(&user.id, entity.entity_type, &entity.id)
            .await?,
    ))
}

async fn active_link(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<Option<InvitationLinkSettings>>> {
    let entity = target(&kind, id)?;
    let record = state.access.hierarchy().entity(&entity).await?;
    Ok(Json(
        state
            .invitations
            .get_active_link(&user.id, &record.workspace_id, entity.entity_type, &entity.id)
            .await?,
    ))
}

async fn list_access_requests(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<Vec<AccessRequest>>> {
    let entity = target(&kind, id)?;
    Ok(Json(
        state
            .access_requests
            .list_pending(&user.id, entity.entity_type, &entity.id)
            .await?,
    ))
}
