use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod access_requests;
pub mod auth;
pub mod entities;
pub mod health;
pub mod invitations;
pub mod links;
pub mod workspaces;

/// Every authenticated route plus the health check. The public link
/// redemption router is mounted separately so it can carry its own limiter.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/workspaces", workspaces::router())
        .nest("/api/entities", entities::router())
        .nest("/api/projects", entities::projects_router())
        .nest("/api/invitations", invitations::router())
        .nest("/api/link-settings", links::settings_router())
        .nest("/api/access-requests", access_requests::router())
}
