use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db::{
    may_assign, normalize_email, AccessRequest, AccessRequestRepository, AccessRequestStatus,
    CreateAccessRequest, EntityRef, EntityType, MembershipRepository, Role, User,
};
use crate::error::{AppError, AppResult};
use crate::services::access::AccessResolver;

/// Body of a process call.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessAccessRequest {
    pub status: AccessRequestStatus,
    #[serde(default)]
    pub denial_reason: Option<String>,
}

#[derive(Clone)]
pub struct AccessRequestService {
    pool: SqlitePool,
    access: AccessResolver,
}

impl AccessRequestService {
    pub fn new(pool: SqlitePool, access: AccessResolver) -> Self {
        Self { pool, access }
    }

    /// Record a pending request from `requester` to join the target.
    pub async fn create(&self, requester: &User, input: CreateAccessRequest) -> AppResult<AccessRequest> {
        let kind = input.request_type;
        if !kind.is_invitable() {
            return Err(AppError::InvalidEntityType(format!(
                "cannot request access to a {kind}"
            )));
        }
        let role = input.role.unwrap_or(Role::Member);
        if !kind.allows_role(role) {
            return Err(AppError::InvalidInput(format!(
                "role {role} is not valid for a {kind}"
            )));
        }

        let target = self
            .access
            .hierarchy()
            .entity(&EntityRef::new(kind, input.target_id))
            .await?;
        if MembershipRepository::find(&self.pool, kind, &target.id, &requester.id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "already a member of {}",
                target.entity_ref()
            )));
        }

        let request = AccessRequestRepository::insert(
            &self.pool,
            &target.workspace_id,
            &requester.id,
            &normalize_email(&requester.email),
            kind,
            &target.id,
            role,
            input.message.as_deref().map(str::trim).filter(|m| !m.is_empty()),
        )
        .await?;

        tracing::info!(
            request_id = %request.id,
            target = %target.entity_ref(),
            requester_id = %requester.id,
            "Access request created"
        );
        Ok(request)
    }

    /// `ProcessAccessRequest`. Approval writes the membership in the same
    /// transaction as the status change, unless the requester already holds
    /// one on the target, which is left as it is.
    pub async fn process(
        &self,
        actor_id: &str,
        request_id: &str,
        status: AccessRequestStatus,
        denial_reason: Option<&str>,
    ) -> AppResult<AccessRequest> {
        let request = AccessRequestRepository::find_by_id(&self.pool, request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("access request {request_id} not found")))?;
        if status == AccessRequestStatus::Pending {
            return Err(AppError::InvalidInput(
                "status must be approved or denied".into(),
            ));
        }
        if request.status != AccessRequestStatus::Pending {
            return Err(AppError::Conflict("access request was already processed".into()));
        }

        let target = EntityRef::new(request.request_type, request.target_id.clone());
        let actor = self.access.require_manager(&target, actor_id).await?;
        if status == AccessRequestStatus::Approved && !may_assign(actor.role, None, request.role) {
            return Err(AppError::Forbidden(format!(
                "{} cannot grant {}",
                actor.role, request.role
            )));
        }

        let denial_reason = match status {
            AccessRequestStatus::Denied => denial_reason,
            _ => None,
        };

        let mut tx = self.pool.begin().await?;
        let processed =
            AccessRequestRepository::mark_processed(&mut *tx, request_id, status, actor_id, denial_reason)
                .await?
                .ok_or_else(|| AppError::Conflict("access request was already processed".into()))?;
        if status == AccessRequestStatus::Approved {
            let existing = MembershipRepository::find(
                &mut *tx,
                processed.request_type,
                &processed.target_id,
                &processed.requester_id,
            )
            .await?;
            match existing {
                // joined some other way since asking; the grant they hold stands
                Some(membership) => tracing::info!(
                    request_id,
                    role = %membership.role,
                    "Requester is already a member, closing request"
                ),
                None => {
                    MembershipRepository::insert(
                        &mut *tx,
                        processed.request_type,
                        &processed.target_id,
                        &processed.requester_id,
                        processed.role,
                    )
                    .await?;
                }
            }
        }
        tx.commit().await?;

        tracing::info!(request_id, %target, status = ?status, actor_id, "Access request processed");
        Ok(processed)
    }

    pub async fn list_pending(
        &self,
        actor_id: &str,
        kind: EntityType,
        target_id: &str,
    ) -> AppResult<Vec<AccessRequest>> {
        self.access
            .require_manager(&EntityRef::new(kind, target_id), actor_id)
            .await?;
        AccessRequestRepository::list_pending_for_target(&self.pool, kind, target_id).await
    }
}
