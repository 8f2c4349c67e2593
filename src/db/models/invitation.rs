use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::db::models::{EntityType, Role};
use crate::error::AppError;

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
    Cancelled,
    Revoked,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Expired => "expired",
            InvitationStatus::Cancelled => "cancelled",
            InvitationStatus::Revoked => "revoked",
        }
    }

    /// Every status other than `pending` is final.
    pub fn is_terminal(self) -> bool {
        self != InvitationStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InvitationMethod {
    Email,
    Link,
    Direct,
}

/// Coarse capability level carried by an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Permission {
    FullEdit,
    #[default]
    Edit,
    Comment,
    ViewOnly,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::FullEdit => "full_edit",
            Permission::Edit => "edit",
            Permission::Comment => "comment",
            Permission::ViewOnly => "view_only",
        }
    }

    /// Fine-grained capabilities implied by this level.
    pub fn capabilities(self) -> InvitationPermissions {
        let (edit, comment, manage) = match self {
            Permission::FullEdit => (true, true, true),
            Permission::Edit => (true, true, false),
            Permission::Comment => (false, true, false),
            Permission::ViewOnly => (false, false, false),
        };
        InvitationPermissions {
            can_view: true,
            can_comment: comment,
            can_edit: edit,
            can_create: edit,
            can_delete: manage,
            can_share: manage,
        }
    }
}

impl FromStr for Permission {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_edit" => Ok(Permission::FullEdit),
            "edit" => Ok(Permission::Edit),
            "comment" => Ok(Permission::Comment),
            "view_only" => Ok(Permission::ViewOnly),
            other => Err(AppError::InvalidInput(format!("unknown permission: {other}"))),
        }
    }
}

/// Boolean capability set; when present on an invitation it replaces the
/// defaults derived from [`Permission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationPermissions {
    pub can_view: bool,
    pub can_comment: bool,
    pub can_edit: bool,
    pub can_create: bool,
    pub can_delete: bool,
    pub can_share: bool,
}

// ============================================================================
// Invitation rows
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Invitation {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    /// Secret; only ever handed out through the invite URL.
    #[serde(skip_serializing)]
    pub token: String,
    /// Link the invitation was minted from, if any.
    pub link_token: Option<String>,
    #[serde(rename = "type")]
    pub invitation_type: EntityType,
    pub target_id: String,
    pub role: Role,
    pub permission: Permission,
    pub permissions: Option<InvitationPermissions>,
    pub inviter_id: String,
    pub invitee_user_id: Option<String>,
    pub status: InvitationStatus,
    pub method: InvitationMethod,
    pub expires_at: Option<NaiveDateTime>,
    /// For link-minted rows: the link's quota and which use this row consumed.
    pub max_uses: Option<i64>,
    pub use_count: Option<i64>,
    pub reminder_count: i64,
    pub last_sent_at: Option<NaiveDateTime>,
    pub accepted_at: Option<NaiveDateTime>,
    pub declined_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Invitation {
    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Explicit override if one was stored, otherwise the coarse level's defaults.
    pub fn effective_permissions(&self) -> InvitationPermissions {
        self.permissions
            .unwrap_or_else(|| self.permission.capabilities())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Invitation {
    fn from_row(r: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let permissions: Option<String> = r.try_get("permissions")?;
        let permissions = permissions
            .map(|raw| serde_json::from_str::<InvitationPermissions>(&raw))
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "permissions".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: r.try_get("id")?,
            workspace_id: r.try_get("workspace_id")?,
            email: r.try_get("email")?,
            token: r.try_get("token")?,
            link_token: r.try_get("link_token")?,
            invitation_type: r.try_get("type")?,
            target_id: r.try_get("target_id")?,
            role: r.try_get("role")?,
            permission: r.try_get("permission")?,
            permissions,
            inviter_id: r.try_get("inviter_id")?,
            invitee_user_id: r.try_get("invitee_user_id")?,
            status: r.try_get("status")?,
            method: r.try_get("method")?,
            expires_at: r.try_get("expires_at")?,
            max_uses: r.try_get("max_uses")?,
            use_count: r.try_get("use_count")?,
            reminder_count: r.try_get("reminder_count")?,
            last_sent_at: r.try_get("last_sent_at")?,
            accepted_at: r.try_get("accepted_at")?,
            declined_at: r.try_get("declined_at")?,
            cancelled_at: r.try_get("cancelled_at")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    }
}

/// Caller-supplied part of a new invitation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvitation {
    pub workspace_id: String,
    pub email: String,
    #[serde(rename = "type")]
    pub invitation_type: EntityType,
    pub target_id: String,
    pub role: Role,
    #[serde(default)]
    pub permission: Permission,
    #[serde(default)]
    pub permissions: Option<InvitationPermissions>,
    /// Hours until expiry; falls back to the configured default.
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

/// Invitation details when the call itself names the target.
#[derive(Debug, Clone, Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub permission: Permission,
    #[serde(default)]
    pub permissions: Option<InvitationPermissions>,
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

impl InviteRequest {
    pub fn into_invitation(
        self,
        workspace_id: &str,
        invitation_type: EntityType,
        target_id: &str,
    ) -> CreateInvitation {
        CreateInvitation {
            workspace_id: workspace_id.to_string(),
            email: self.email,
            invitation_type,
            target_id: target_id.to_string(),
            role: self.role,
            permission: self.permission,
            permissions: self.permissions,
            expires_in_hours: self.expires_in_hours,
        }
    }
}

/// Row-level values handed to the repository.
#[derive(Debug, Clone)]
pub struct NewInvitation {
    pub workspace_id: String,
    pub email: String,
    pub token: String,
    pub link_token: Option<String>,
    pub invitation_type: EntityType,
    pub target_id: String,
    pub role: Role,
    pub permission: Permission,
    pub permissions: Option<InvitationPermissions>,
    pub inviter_id: String,
    pub method: InvitationMethod,
    pub expires_at: Option<NaiveDateTime>,
    pub max_uses: Option<i64>,
    pub use_count: Option<i64>,
}
