use sqlx::SqlitePool;

use crate::db::{EntityRecord, EntityRef, EntityRepository};
use crate::error::{AppError, AppResult};

/// Deepest legal path: task -> project -> folder -> space -> workspace.
const MAX_DEPTH: usize = 5;

/// Walks parent references from an entity up to its workspace.
#[derive(Clone)]
pub struct HierarchyResolver {
    pool: SqlitePool,
}

impl HierarchyResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load one entity or fail with `NotFound`.
    pub async fn entity(&self, entity: &EntityRef) -> AppResult<EntityRecord> {
        EntityRepository::find(&self.pool, entity)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{entity} not found")))
    }

    /// The entity followed by every ancestor, ending at the workspace.
    ///
    /// A parent reference that points at a missing row is reported as
    /// `NotFound` rather than truncating the chain.
    pub async fn load_path(&self, entity: &EntityRef) -> AppResult<Vec<EntityRecord>> {
        let mut path = vec![self.entity(entity).await?];

        while let Some(parent) = path.last().and_then(|r| r.parent.clone()) {
            if path.len() >= MAX_DEPTH {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "hierarchy above {entity} is deeper than {MAX_DEPTH} levels"
                )));
            }

            let record = EntityRepository::find(&self.pool, &parent)
                .await?
                .ok_or_else(|| {
                    tracing::warn!(%entity, %parent, "Dangling parent reference");
                    AppError::NotFound(format!("{parent} referenced by {entity} not found"))
                })?;
            path.push(record);
        }

        Ok(path)
    }

    /// `ParentChain`: ancestors only, immediate parent first.
    pub async fn parent_chain(&self, entity: &EntityRef) -> AppResult<Vec<EntityRef>> {
        let path = self.load_path(entity).await?;
        Ok(path.iter().skip(1).map(EntityRecord::entity_ref).collect())
    }
}
