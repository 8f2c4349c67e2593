use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Membership role. Which roles are legal depends on the entity kind, see
/// [`EntityType::role_set`](crate::db::models::EntityType::role_set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Lead,
    Member,
    LimitedMember,
    Guest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Lead => "lead",
            Role::Member => "member",
            Role::LimitedMember => "limited_member",
            Role::Guest => "guest",
        }
    }

    /// Privilege rank: owner > admin > lead = member > limited_member > guest.
    pub fn rank(self) -> u8 {
        match self {
            Role::Owner => 5,
            Role::Admin => 4,
            Role::Lead | Role::Member => 3,
            Role::LimitedMember => 2,
            Role::Guest => 1,
        }
    }

    pub fn cmp_rank(self, other: Role) -> Ordering {
        self.rank().cmp(&other.rank())
    }

    pub fn outranks_or_equals(self, other: Role) -> bool {
        self.cmp_rank(other) != Ordering::Less
    }

    /// Roles that may add, change and remove other members.
    pub fn can_manage_members(self) -> bool {
        matches!(self, Role::Owner | Role::Admin | Role::Lead)
    }

    /// Inherited roles that see through `restricted` visibility.
    pub fn bypasses_restrictions(self) -> bool {
        self.rank() >= Role::Admin.rank()
    }

    pub fn can_edit(self) -> bool {
        self.rank() >= Role::Member.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "lead" => Ok(Role::Lead),
            "member" => Ok(Role::Member),
            "limited_member" => Ok(Role::LimitedMember),
            "guest" => Ok(Role::Guest),
            other => Err(AppError::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

/// Decide whether `actor` (the requester's effective role) may move a member
/// from `current` to `requested`. The actor must be able to manage members and
/// must outrank or equal both roles involved.
pub fn may_assign(actor: Role, current: Option<Role>, requested: Role) -> bool {
    actor.can_manage_members()
        && actor.outranks_or_equals(requested)
        && current.map_or(true, |c| actor.outranks_or_equals(c))
}
