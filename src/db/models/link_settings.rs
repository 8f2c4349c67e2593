use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::db::models::entity::json_list;
use crate::db::models::{email_domain, EntityType, Permission, Role};

/// Reusable invitation template keyed by (workspace, type, target).
#[derive(Debug, Clone, Serialize)]
pub struct InvitationLinkSettings {
    pub id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub link_type: EntityType,
    pub target_id: String,
    pub link_token: String,
    pub role: Role,
    pub permission: Permission,
    pub is_active: bool,
    pub requires_approval: bool,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub expires_at: Option<NaiveDateTime>,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Why a link cannot be redeemed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Valid,
    Inactive,
    Expired,
    Exhausted,
}

impl InvitationLinkSettings {
    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.use_count >= max)
    }

    pub fn state_at(&self, now: NaiveDateTime) -> LinkState {
        if !self.is_active {
            LinkState::Inactive
        } else if self.is_expired_at(now) {
            LinkState::Expired
        } else if self.is_exhausted() {
            LinkState::Exhausted
        } else {
            LinkState::Valid
        }
    }

    /// Check a normalized email against the domain lists. The block list wins
    /// over the allow list; an empty allow list admits every domain.
    pub fn admits_email(&self, email: &str) -> bool {
        let Some(domain) = email_domain(email) else {
            return false;
        };
        let matches = |d: &String| d.eq_ignore_ascii_case(domain);

        if self.blocked_domains.iter().any(matches) {
            return false;
        }
        self.allowed_domains.is_empty() || self.allowed_domains.iter().any(matches)
    }
}

impl<'r> FromRow<'r, SqliteRow> for InvitationLinkSettings {
    fn from_row(r: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: r.try_get("id")?,
            workspace_id: r.try_get("workspace_id")?,
            link_type: r.try_get("type")?,
            target_id: r.try_get("target_id")?,
            link_token: r.try_get("link_token")?,
            role: r.try_get("role")?,
            permission: r.try_get("permission")?,
            is_active: r.try_get("is_active")?,
            requires_approval: r.try_get("requires_approval")?,
            allowed_domains: json_list(r, "allowed_domains")?,
            blocked_domains: json_list(r, "blocked_domains")?,
            max_uses: r.try_get("max_uses")?,
            use_count: r.try_get("use_count")?,
            expires_at: r.try_get("expires_at")?,
            created_by: r.try_get("created_by")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLinkSettings {
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub link_type: EntityType,
    pub target_id: String,
    pub role: Role,
    #[serde(default)]
    pub permission: Permission,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    #[serde(default)]
    pub max_uses: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<NaiveDateTime>,
}
