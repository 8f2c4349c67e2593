use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{CreateLinkSettings, InvitationLinkSettings};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::services::invitations::LinkRedemption;
use crate::AppState;

/// Link management for members of the target.
pub fn settings_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_link))
        .route("/:link_id", delete(deactivate_link))
}

/// Public redemption endpoint. Rate limited by the caller of this function.
pub fn redeem_router() -> Router<Arc<AppState>> {
    Router::new().route("/:token/redeem", post(redeem))
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub email: String,
}

async fn create_link(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(input): Json<CreateLinkSettings>,
) -> AppResult<(StatusCode, Json<InvitationLinkSettings>)> {
    let settings = state
        .invitations
        .create_link_settings(&user.id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(settings)))
}

async fn deactivate_link(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(link_id): Path<String>,
) -> AppResult<Json<InvitationLinkSettings>> {
    Ok(Json(
        state.invitations.deactivate_link(&user.id, &link_id).await?,
    ))
}

async fn redeem(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(request): Json<RedeemRequest>,
) -> AppResult<(StatusCode, Json<LinkRedemption>)> {
    let redemption = state
        .invitations
        .use_invitation_link(&token, &request.email)
        .await?;
    Ok((StatusCode::CREATED, Json(redemption)))
}
