use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::models::{EntityRef, EntityType, Role};

/// A direct grant stored on the entity itself.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Membership {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// How a user came to hold access on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessOrigin {
    /// Membership row on the entity itself.
    Direct,
    /// Membership on an ancestor that cascades down.
    Inherited { from: EntityRef },
    /// Named on the entity's allow-lists without any membership.
    AllowList,
}

impl AccessOrigin {
    /// Empty for direct grants, `type:id` of the granting ancestor otherwise.
    pub fn key(&self) -> String {
        match self {
            AccessOrigin::Direct => String::new(),
            AccessOrigin::Inherited { from } => from.to_string(),
            AccessOrigin::AllowList => "allow_list".to_string(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, AccessOrigin::Direct)
    }
}

/// Outcome of a single access decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveAccess {
    pub role: Role,
    pub origin: AccessOrigin,
}

/// A user with effective access on an entity, enriched from the identity store.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveMember {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub origin: AccessOrigin,
}

/// Answer for "what can this user do here", used by the adapter to render
/// controls and by callers that want more than a yes/no.
#[derive(Debug, Clone, Serialize)]
pub struct AccessInfo {
    pub entity: EntityRef,
    pub workspace_id: String,
    pub user_id: String,
    pub has_access: bool,
    pub role: Option<Role>,
    pub origin: Option<AccessOrigin>,
    pub is_direct: bool,
    pub can_edit: bool,
    pub can_manage_members: bool,
}
