use chrono::Utc;
use sqlx::{Executor, QueryBuilder, Sqlite};
use uuid::Uuid;

use crate::db::models::{CreateEntity, EntityRecord, EntityRef, EntityType, UpdateVisibility};
use crate::error::{AppError, AppResult};

// ============================================================================
// Entity Store
// ============================================================================

/// Read/write access to the hierarchy tables. Every query projects onto the
/// same column shape so one `EntityRecord` mapping serves all kinds.
pub struct EntityRepository;

/// Normalized projection for each kind. A project's parent is its folder when
/// it has one, otherwise its space.
fn columns(kind: EntityType) -> &'static str {
    match kind {
        EntityType::Workspace => {
            "'workspace' AS entity_type, id, id AS workspace_id, name, \
             NULL AS parent_type, NULL AS parent_id, 'public' AS visibility, \
             '[]' AS allowed_users, '[]' AS allowed_teams, created_at, updated_at"
        }
        EntityType::Team => {
            "'team' AS entity_type, id, workspace_id, name, \
             'workspace' AS parent_type, workspace_id AS parent_id, 'public' AS visibility, \
             '[]' AS allowed_users, '[]' AS allowed_teams, created_at, updated_at"
        }
        EntityType::Space => {
            "'space' AS entity_type, id, workspace_id, name, \
             'workspace' AS parent_type, workspace_id AS parent_id, visibility, \
             allowed_users, allowed_teams, created_at, updated_at"
        }
        EntityType::Folder => {
            "'folder' AS entity_type, id, workspace_id, name, \
             'space' AS parent_type, space_id AS parent_id, visibility, \
             allowed_users, allowed_teams, created_at, updated_at"
        }
        EntityType::Project => {
            "'project' AS entity_type, id, workspace_id, name, \
             CASE WHEN folder_id IS NULL THEN 'space' ELSE 'folder' END AS parent_type, \
             COALESCE(folder_id, space_id) AS parent_id, visibility, \
             allowed_users, allowed_teams, created_at, updated_at"
        }
        EntityType::Task => {
            "'task' AS entity_type, id, workspace_id, name, \
             'project' AS parent_type, project_id AS parent_id, visibility, \
             allowed_users, allowed_teams, created_at, updated_at"
        }
    }
}

fn id_list(ids: &[String]) -> AppResult<String> {
    serde_json::to_string(ids).map_err(|e| AppError::Internal(e.into()))
}

impl EntityRepository {
    /// `GetEntity(type, id)` for the hierarchy resolver.
    pub async fn find<'e, E>(executor: E, entity: &EntityRef) -> AppResult<Option<EntityRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            columns(entity.entity_type),
            entity.entity_type.entity_table()
        );

        sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(&entity.id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// All rows of `kind` belonging to any of the given workspaces.
    pub async fn list_in_workspaces<'e, E>(
        executor: E,
        kind: EntityType,
        workspace_ids: &[String],
    ) -> AppResult<Vec<EntityRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if workspace_ids.is_empty() {
            return Ok(Vec::new());
        }

        let scope_column = match kind {
            EntityType::Workspace => "id",
            _ => "workspace_id",
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE {} IN (",
            columns(kind),
            kind.entity_table(),
            scope_column
        ));
        let mut ids = qb.separated(", ");
        for id in workspace_ids {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(") ORDER BY created_at ASC");

        qb.build_query_as::<EntityRecord>()
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Workspaces in which the user has any foothold: a membership at any
    /// level, a team, or a place on some allow-list.
    pub async fn workspace_scope_for_user<'e, E>(executor: E, user_id: &str) -> AppResult<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT workspace_id FROM workspace_members WHERE user_id = ?
            UNION
            SELECT s.workspace_id FROM space_members m JOIN spaces s ON s.id = m.space_id
            WHERE m.user_id = ?
            UNION
            SELECT f.workspace_id FROM folder_members m JOIN folders f ON f.id = m.folder_id
            WHERE m.user_id = ?
            UNION
            SELECT p.workspace_id FROM project_members m JOIN projects p ON p.id = m.project_id
            WHERE m.user_id = ?
            UNION
            SELECT t.workspace_id FROM team_members m JOIN teams t ON t.id = m.team_id
            WHERE m.user_id = ?
            UNION
            SELECT workspace_id FROM spaces
            WHERE EXISTS (SELECT 1 FROM json_each(spaces.allowed_users) WHERE json_each.value = ?)
            UNION
            SELECT workspace_id FROM folders
            WHERE EXISTS (SELECT 1 FROM json_each(folders.allowed_users) WHERE json_each.value = ?)
            UNION
            SELECT workspace_id FROM projects
            WHERE EXISTS (SELECT 1 FROM json_each(projects.allowed_users) WHERE json_each.value = ?)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn create_workspace<'e, E>(
        executor: E,
        name: &str,
        created_by: &str,
    ) -> AppResult<EntityRecord>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let sql = format!(
            "INSERT INTO workspaces (id, name, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {}",
            columns(EntityType::Workspace)
        );

        sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(id)
            .bind(name)
            .bind(created_by)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn create_team<'e, E>(
        executor: E,
        workspace_id: &str,
        name: &str,
    ) -> AppResult<EntityRecord>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let sql = format!(
            "INSERT INTO teams (id, workspace_id, name, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {}",
            columns(EntityType::Team)
        );

        sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(id)
            .bind(workspace_id)
            .bind(name)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Insert a space, folder, project or task. The caller has already
    /// resolved the parent, so `workspace_id` and `space_id` are trusted here.
    pub async fn create_child<'e, E>(
        executor: E,
        kind: EntityType,
        workspace_id: &str,
        space_id: Option<&str>,
        input: &CreateEntity,
    ) -> AppResult<EntityRecord>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let allowed_users = id_list(&input.allowed_users)?;
        let allowed_teams = id_list(&input.allowed_teams)?;

        let (sql, parent, folder) = match kind {
            EntityType::Space => (
                "INSERT INTO spaces (id, workspace_id, name, visibility, allowed_users, \
                 allowed_teams, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                None,
                None,
            ),
            EntityType::Folder => (
                "INSERT INTO folders (id, workspace_id, name, visibility, allowed_users, \
                 allowed_teams, created_at, updated_at, space_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                Some(input.parent_id.as_str()),
                None,
            ),
            EntityType::Project => (
                "INSERT INTO projects (id, workspace_id, name, visibility, allowed_users, \
                 allowed_teams, created_at, updated_at, space_id, folder_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                space_id,
                Some(input.folder_id.as_deref()),
            ),
            EntityType::Task => (
                "INSERT INTO tasks (id, workspace_id, name, visibility, allowed_users, \
                 allowed_teams, created_at, updated_at, project_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                Some(input.parent_id.as_str()),
                None,
            ),
            other => {
                return Err(AppError::InvalidEntityType(format!(
                    "{other} is not created through create_child"
                )))
            }
        };
        let sql = format!("{sql} RETURNING {}", columns(kind));

        let mut query = sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(id)
            .bind(workspace_id)
            .bind(&input.name)
            .bind(input.visibility)
            .bind(allowed_users)
            .bind(allowed_teams)
            .bind(now)
            .bind(now);
        if let Some(parent) = parent {
            query = query.bind(parent);
        }
        if let Some(folder) = folder {
            query = query.bind(folder);
        }

        query
            .fetch_one(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Replace the visibility overlay of a space, folder, project or task.
    pub async fn update_visibility<'e, E>(
        executor: E,
        entity: &EntityRef,
        update: &UpdateVisibility,
    ) -> AppResult<Option<EntityRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if matches!(entity.entity_type, EntityType::Workspace | EntityType::Team) {
            return Err(AppError::InvalidEntityType(format!(
                "{} has no visibility overlay",
                entity.entity_type
            )));
        }

        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE {} SET visibility = ?, allowed_users = ?, allowed_teams = ?, updated_at = ? \
             WHERE id = ? RETURNING {}",
            entity.entity_type.entity_table(),
            columns(entity.entity_type)
        );

        sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(update.visibility)
            .bind(id_list(&update.allowed_users)?)
            .bind(id_list(&update.allowed_teams)?)
            .bind(now)
            .bind(&entity.id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// `(space_id, folder_id)` of a project.
    pub async fn project_placement<'e, E>(
        executor: E,
        project_id: &str,
    ) -> AppResult<Option<(String, Option<String>)>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT space_id, folder_id FROM projects WHERE id = ?",
        )
        .bind(project_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Space a folder lives in.
    pub async fn folder_space<'e, E>(executor: E, folder_id: &str) -> AppResult<Option<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, String>("SELECT space_id FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Write a project's name (when given) and its resolved folder.
    pub async fn update_project<'e, E>(
        executor: E,
        project_id: &str,
        name: Option<&str>,
        folder_id: Option<&str>,
    ) -> AppResult<Option<EntityRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE projects SET name = COALESCE(?, name), folder_id = ?, updated_at = ? \
             WHERE id = ? RETURNING {}",
            columns(EntityType::Project)
        );

        sqlx::query_as::<_, EntityRecord>(&sql)
            .bind(name)
            .bind(folder_id)
            .bind(now)
            .bind(project_id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }
}
