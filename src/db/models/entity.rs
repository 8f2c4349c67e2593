use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::db::models::{Patch, Role};
use crate::error::AppError;

/// Kinds of entity that can carry memberships or appear in a hierarchy chain.
///
/// `Team` is not part of the containment hierarchy; it hangs off its
/// workspace and only matters for `allowed_teams` overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EntityType {
    Workspace,
    Space,
    Folder,
    Project,
    Task,
    Team,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Workspace => "workspace",
            EntityType::Space => "space",
            EntityType::Folder => "folder",
            EntityType::Project => "project",
            EntityType::Task => "task",
            EntityType::Team => "team",
        }
    }

    /// Table holding rows of this kind.
    pub fn entity_table(self) -> &'static str {
        match self {
            EntityType::Workspace => "workspaces",
            EntityType::Space => "spaces",
            EntityType::Folder => "folders",
            EntityType::Project => "projects",
            EntityType::Task => "tasks",
            EntityType::Team => "teams",
        }
    }

    /// Membership table and its foreign-key column. Tasks carry no direct
    /// memberships; access to a task always comes from its project chain.
    pub fn member_table(self) -> Option<(&'static str, &'static str)> {
        match self {
            EntityType::Workspace => Some(("workspace_members", "workspace_id")),
            EntityType::Space => Some(("space_members", "space_id")),
            EntityType::Folder => Some(("folder_members", "folder_id")),
            EntityType::Project => Some(("project_members", "project_id")),
            EntityType::Team => Some(("team_members", "team_id")),
            EntityType::Task => None,
        }
    }

    /// Roles a direct membership on this kind may hold.
    pub fn role_set(self) -> &'static [Role] {
        match self {
            EntityType::Workspace => &[
                Role::Owner,
                Role::Admin,
                Role::Member,
                Role::LimitedMember,
                Role::Guest,
            ],
            EntityType::Space | EntityType::Folder => {
                &[Role::Member, Role::LimitedMember, Role::Guest]
            }
            EntityType::Project => &[
                Role::Lead,
                Role::Member,
                Role::LimitedMember,
                Role::Guest,
            ],
            EntityType::Team => &[Role::Member],
            EntityType::Task => &[],
        }
    }

    pub fn allows_role(self, role: Role) -> bool {
        self.role_set().contains(&role)
    }

    /// Kinds that can be the target of an invitation, a link or an access request.
    pub fn is_invitable(self) -> bool {
        self.member_table().is_some()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(EntityType::Workspace),
            "space" => Ok(EntityType::Space),
            "folder" => Ok(EntityType::Folder),
            "project" => Ok(EntityType::Project),
            "task" => Ok(EntityType::Task),
            "team" => Ok(EntityType::Team),
            other => Err(AppError::InvalidEntityType(other.to_string())),
        }
    }
}

/// A (type, id) pair naming one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to everyone holding access on an ancestor.
    #[default]
    Public,
    /// Inherited access requires a place on the allow-lists.
    Restricted,
}

impl FromStr for Visibility {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "restricted" => Ok(Visibility::Restricted),
            other => Err(AppError::InvalidInput(format!("unknown visibility: {other}"))),
        }
    }
}

/// One row of the entity store, normalized across the per-kind tables.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Immediate parent; `None` only for workspaces. Teams point at their workspace.
    pub parent: Option<EntityRef>,
    pub visibility: Visibility,
    pub allowed_users: Vec<String>,
    pub allowed_teams: Vec<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl EntityRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.id.clone())
    }

    /// Whether the allow-lists name this user directly or through a team.
    pub fn is_allow_listed<'a>(
        &self,
        user_id: &str,
        mut team_ids: impl Iterator<Item = &'a String>,
    ) -> bool {
        self.allowed_users.iter().any(|u| u == user_id)
            || team_ids.any(|t| self.allowed_teams.contains(t))
    }
}

impl<'r> FromRow<'r, SqliteRow> for EntityRecord {
    fn from_row(r: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let parent_type: Option<EntityType> = r.try_get("parent_type")?;
        let parent_id: Option<String> = r.try_get("parent_id")?;
        let parent = match (parent_type, parent_id) {
            (Some(t), Some(id)) => Some(EntityRef::new(t, id)),
            _ => None,
        };

        Ok(Self {
            entity_type: r.try_get("entity_type")?,
            id: r.try_get("id")?,
            workspace_id: r.try_get("workspace_id")?,
            name: r.try_get("name")?,
            parent,
            visibility: r.try_get("visibility")?,
            allowed_users: json_list(r, "allowed_users")?,
            allowed_teams: json_list(r, "allowed_teams")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    }
}

/// Decode a TEXT column holding a JSON array of strings.
pub(crate) fn json_list(r: &SqliteRow, column: &str) -> Result<Vec<String>, sqlx::Error> {
    let raw: String = r.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

/// New space/folder/project/task row. `parent_id` is the space for folders and
/// projects, and the project for tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEntity {
    pub name: String,
    pub parent_id: String,
    /// Projects only: optional folder inside the parent space.
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_teams: Vec<String>,
}

/// Replacement overlay for an entity.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateVisibility {
    pub visibility: Visibility,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_teams: Vec<String>,
}

/// Partial project update. `folder_id` distinguishes "leave as is", "move
/// out of its folder" and "move into this folder".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProject {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub folder_id: Patch<String>,
}
