use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::models::{EntityType, Role};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AccessRequestStatus {
    Pending,
    Approved,
    Denied,
}

impl FromStr for AccessRequestStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AccessRequestStatus::Pending),
            "approved" => Ok(AccessRequestStatus::Approved),
            "denied" => Ok(AccessRequestStatus::Denied),
            other => Err(AppError::InvalidInput(format!(
                "unknown access request status: {other}"
            ))),
        }
    }
}

/// A user-initiated ask to join an entity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: String,
    pub workspace_id: String,
    pub requester_id: String,
    pub email: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub request_type: EntityType,
    pub target_id: String,
    /// Role granted on approval.
    pub role: Role,
    pub message: Option<String>,
    pub status: AccessRequestStatus,
    pub processed_by: Option<String>,
    pub processed_at: Option<NaiveDateTime>,
    pub denial_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccessRequest {
    #[serde(rename = "type")]
    pub request_type: EntityType,
    pub target_id: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub message: Option<String>,
}
