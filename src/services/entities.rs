use sqlx::SqlitePool;

use crate::db::{
    CreateEntity, EntityRecord, EntityRef, EntityRepository, EntityType, MembershipRepository,
    Patch, Role, UpdateProject, UpdateVisibility,
};
use crate::error::{AppError, AppResult};
use crate::services::access::AccessResolver;

/// Ownership-creation path and structural edits of the hierarchy.
#[derive(Clone)]
pub struct EntityService {
    pool: SqlitePool,
    access: AccessResolver,
}

impl EntityService {
    pub fn new(pool: SqlitePool, access: AccessResolver) -> Self {
        Self { pool, access }
    }

    /// New workspace; the creator becomes its owner in the same transaction.
    pub async fn create_workspace(&self, creator_id: &str, name: &str) -> AppResult<EntityRecord> {
        let name = require_name(name)?;

        let mut tx = self.pool.begin().await?;
        let workspace = EntityRepository::create_workspace(&mut *tx, name, creator_id).await?;
        MembershipRepository::insert(
            &mut *tx,
            EntityType::Workspace,
            &workspace.id,
            creator_id,
            Role::Owner,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(workspace_id = %workspace.id, creator_id, "Workspace created");
        Ok(workspace)
    }

    pub async fn create_team(&self, actor_id: &str, workspace_id: &str, name: &str) -> AppResult<EntityRecord> {
        let name = require_name(name)?;
        let workspace = EntityRef::new(EntityType::Workspace, workspace_id);
        self.access.require_manager(&workspace, actor_id).await?;

        let team = EntityRepository::create_team(&self.pool, workspace_id, name).await?;
        tracing::info!(team_id = %team.id, workspace_id, "Team created");
        Ok(team)
    }

    /// Create a space, folder, project or task under `input.parent_id`.
    /// The actor needs an editing role on the parent.
    pub async fn create_child(
        &self,
        actor_id: &str,
        kind: EntityType,
        input: &CreateEntity,
    ) -> AppResult<EntityRecord> {
        require_name(&input.name)?;
        let parent_kind = match kind {
            EntityType::Space => EntityType::Workspace,
            EntityType::Folder | EntityType::Project => EntityType::Space,
            EntityType::Task => EntityType::Project,
            other => {
                return Err(AppError::InvalidEntityType(format!(
                    "{other} has its own creation path"
                )))
            }
        };
        if input.folder_id.is_some() && kind != EntityType::Project {
            return Err(AppError::InvalidInput(
                "only projects can be placed in a folder".into(),
            ));
        }

        let parent_ref = EntityRef::new(parent_kind, input.parent_id.clone());
        let parent = self.access.hierarchy().entity(&parent_ref).await?;
        self.access.require_editor(&parent_ref, actor_id).await?;

        if let Some(folder_id) = &input.folder_id {
            self.check_folder_in_space(folder_id, &parent.id).await?;
        }

        let space_id = (kind == EntityType::Project).then_some(parent.id.as_str());
        let record =
            EntityRepository::create_child(&self.pool, kind, &parent.workspace_id, space_id, input)
                .await?;
        tracing::info!(entity = %record.entity_ref(), parent = %parent_ref, "Entity created");
        Ok(record)
    }

    /// Rename a project and/or move it in or out of a folder of its space.
    pub async fn update_project(
        &self,
        actor_id: &str,
        project_id: &str,
        update: UpdateProject,
    ) -> AppResult<EntityRecord> {
        let project = EntityRef::new(EntityType::Project, project_id);
        self.access.require_editor(&project, actor_id).await?;

        if let Some(name) = &update.name {
            require_name(name)?;
        }

        let (space_id, current_folder) = EntityRepository::project_placement(&self.pool, project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{project} not found")))?;

        if let Patch::Set(folder_id) = &update.folder_id {
            self.check_folder_in_space(folder_id, &space_id).await?;
        }
        let folder_id = update.folder_id.apply(current_folder);

        let record = EntityRepository::update_project(
            &self.pool,
            project_id,
            update.name.as_deref(),
            folder_id.as_deref(),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{project} not found")))?;

        tracing::info!(project_id, folder_id = ?folder_id, "Project updated");
        Ok(record)
    }

    /// Replace the visibility overlay. Managers only.
    pub async fn set_visibility(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        update: &UpdateVisibility,
    ) -> AppResult<EntityRecord> {
        self.access.require_manager(entity, actor_id).await?;

        let record = EntityRepository::update_visibility(&self.pool, entity, update)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{entity} not found")))?;

        tracing::info!(%entity, visibility = ?update.visibility, "Visibility changed");
        Ok(record)
    }

    async fn check_folder_in_space(&self, folder_id: &str, space_id: &str) -> AppResult<()> {
        let folder_space = EntityRepository::folder_space(&self.pool, folder_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("folder:{folder_id} not found")))?;

        if folder_space != space_id {
            return Err(AppError::InvalidInput(format!(
                "folder {folder_id} belongs to a different space"
            )));
        }
        Ok(())
    }
}

fn require_name(name: &str) -> AppResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("name must not be empty".into()));
    }
    Ok(name)
}
