use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};

use crate::db::{AccessRequest, CreateAccessRequest};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::services::access_requests::ProcessAccessRequest;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_request))
        .route("/:request_id/process", post(process_request))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(input): Json<CreateAccessRequest>,
) -> AppResult<(StatusCode, Json<AccessRequest>)> {
    let request = state.access_requests.create(&user, input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn process_request(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(request_id): Path<String>,
    Json(body): Json<ProcessAccessRequest>,
) -> AppResult<Json<AccessRequest>> {
    Ok(Json(
        state
            .access_requests
            .process(
                &user.id,
                &request_id,
                body.status,
                body.denial_reason.as_deref(),
            )
            .await?,
    ))
}
