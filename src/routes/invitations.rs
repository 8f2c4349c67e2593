use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{CreateInvitation, Invitation};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::services::invitations::{AcceptedInvitation, IssuedInvitation};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_invitation))
        .route("/mine", get(my_invitations))
        .route("/accept", post(accept_by_token))
        .route("/:invitation_id/accept", post(accept_by_id))
        .route("/:invitation_id/decline", post(decline))
        .route("/:invitation_id/resend", post(resend))
        .route("/:invitation_id/regenerate", post(regenerate))
        .route("/:invitation_id/cancel", post(cancel))
        .route("/:invitation_id/revoke", post(revoke))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

async fn create_invitation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(input): Json<CreateInvitation>,
) -> AppResult<(StatusCode, Json<IssuedInvitation>)> {
    let issued = state.invitations.create_invitation(&user.id, input).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn my_invitations(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<Vec<Invitation>>> {
    Ok(Json(state.invitations.list_pending_for_user(&user).await?))
}

async fn accept_by_token(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<TokenRequest>,
) -> AppResult<Json<AcceptedInvitation>> {
    Ok(Json(
        state
            .invitations
            .accept_by_token(&user, &request.token)
            .await?,
    ))
}

async fn accept_by_id(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<AcceptedInvitation>> {
    Ok(Json(
        state.invitations.accept_by_id(&user, &invitation_id).await?,
    ))
}

async fn decline(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<Invitation>> {
    Ok(Json(
        state.invitations.decline_by_id(&user, &invitation_id).await?,
    ))
}

async fn resend(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<IssuedInvitation>> {
    Ok(Json(state.invitations.resend(&user.id, &invitation_id).await?))
}

async fn regenerate(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<IssuedInvitation>> {
    Ok(Json(
        state
            .invitations
            .regenerate_token(&user.id, &invitation_id)
            .await?,
    ))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<Invitation>> {
    Ok(Json(state.invitations.cancel(&user.id, &invitation_id).await?))
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(invitation_id): Path<String>,
) -> AppResult<Json<Invitation>> {
    Ok(Json(state.invitations.revoke(&user.id, &invitation_id).await?))
}
