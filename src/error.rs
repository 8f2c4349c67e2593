use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Every failure the engine reports. Business outcomes (expired token,
/// exhausted link, last owner) are ordinary variants; storage and
/// infrastructure failures are kept apart in `Database` / `Internal`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Workspace must keep at least one owner")]
    LastOwner,

    #[error("Invalid or unknown token")]
    InvalidToken,

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl AppError {
    /// Stable machine-readable code, also used as the JSON `code` field.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::InvalidEntityType(_) => "INVALID_ENTITY_TYPE",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::LastOwner => "LAST_OWNER",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::Expired(_) => "EXPIRED",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Jwt(_) => "INVALID_TOKEN",
            AppError::Request(_) => "EXTERNAL_REQUEST_FAILED",
        }
    }

    /// Map a unique-constraint violation to `Conflict`, pass anything else through.
    pub fn from_insert(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(format!("{what} already exists"))
            }
            _ => AppError::Database(err),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::InvalidEntityType(_) | AppError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::LastOwner => (StatusCode::CONFLICT, self.to_string()),
            AppError::InvalidToken => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Expired(_) => (StatusCode::GONE, self.to_string()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("JWT error: {:?}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    "Invalid or expired token".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
