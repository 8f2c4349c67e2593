use sqlx::SqlitePool;

use crate::db::{may_assign, EntityRef, Membership, MembershipRepository, Role};
use crate::error::{AppError, AppResult};
use crate::services::access::AccessResolver;

/// Direct membership management with the role comparator and the
/// last-owner guard applied.
#[derive(Clone)]
pub struct MemberService {
    pool: SqlitePool,
    access: AccessResolver,
}

impl MemberService {
    pub fn new(pool: SqlitePool, access: AccessResolver) -> Self {
        Self { pool, access }
    }

    /// Grant `role` on `entity` to `user_id` directly.
    pub async fn add_member(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        user_id: &str,
        role: Role,
    ) -> AppResult<Membership> {
        if entity.entity_type.member_table().is_none() {
            return Err(AppError::InvalidEntityType(format!(
                "{} does not hold direct memberships",
                entity.entity_type
            )));
        }
        if !entity.entity_type.allows_role(role) {
            return Err(AppError::InvalidInput(format!(
                "role {role} is not valid for a {}",
                entity.entity_type
            )));
        }

        let actor = self.access.require_manager(entity, actor_id).await?;
        if !may_assign(actor.role, None, role) {
            return Err(AppError::Forbidden(format!(
                "{} cannot grant {role}",
                actor.role
            )));
        }

        let membership =
            MembershipRepository::insert(&self.pool, entity.entity_type, &entity.id, user_id, role)
                .await?;
        tracing::info!(%entity, user_id, %role, actor_id, "Member added");
        Ok(membership)
    }

    /// `UpdateMemberRole`. The acting user must outrank or equal both the
    /// member's current role and the requested one.
    pub async fn update_member_role(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        user_id: &str,
        role: Role,
    ) -> AppResult<Membership> {
        if !entity.entity_type.allows_role(role) {
            return Err(AppError::InvalidInput(format!(
                "role {role} is not valid for a {}",
                entity.entity_type
            )));
        }

        let current = MembershipRepository::find(&self.pool, entity.entity_type, &entity.id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{user_id} is not a member of {entity}")))?;

        let actor = self.access.require_manager(entity, actor_id).await?;
        if !may_assign(actor.role, Some(current.role), role) {
            return Err(AppError::Forbidden(format!(
                "{} cannot change a {} to {role}",
                actor.role, current.role
            )));
        }

        match MembershipRepository::update_role_guarded(
            &self.pool,
            entity.entity_type,
            &entity.id,
            user_id,
            role,
        )
        .await?
        {
            Some(updated) => {
                tracing::info!(%entity, user_id, from = %current.role, to = %role, actor_id, "Member role changed");
                Ok(updated)
            }
            None => Err(self.explain_refusal(entity, user_id).await?),
        }
    }

    /// `RemoveMember`. Members may always remove themselves; removing someone
    /// else needs a managing role that outranks or equals theirs.
    pub async fn remove_member(&self, actor_id: &str, entity: &EntityRef, user_id: &str) -> AppResult<()> {
        let current = MembershipRepository::find(&self.pool, entity.entity_type, &entity.id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{user_id} is not a member of {entity}")))?;

        if actor_id != user_id {
            let actor = self.access.require_manager(entity, actor_id).await?;
            if !actor.role.outranks_or_equals(current.role) {
                return Err(AppError::Forbidden(format!(
                    "{} cannot remove a {}",
                    actor.role, current.role
                )));
            }
        }

        if MembershipRepository::delete_guarded(&self.pool, entity.entity_type, &entity.id, user_id)
            .await?
        {
            tracing::info!(%entity, user_id, actor_id, "Member removed");
            Ok(())
        } else {
            Err(self.explain_refusal(entity, user_id).await?)
        }
    }

    /// A guarded write touched no row: the member vanished concurrently, or
    /// they are the last owner.
    async fn explain_refusal(&self, entity: &EntityRef, user_id: &str) -> AppResult<AppError> {
        let still_there =
            MembershipRepository::find(&self.pool, entity.entity_type, &entity.id, user_id).await?;
        Ok(match still_there {
            Some(_) => {
                tracing::warn!(%entity, user_id, "Refused to drop the last owner");
                AppError::LastOwner
            }
            None => AppError::NotFound(format!("{user_id} is not a member of {entity}")),
        })
    }
}
