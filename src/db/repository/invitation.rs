use chrono::{NaiveDateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::db::models::{EntityType, Invitation, InvitationStatus, NewInvitation};
use crate::error::{AppError, AppResult};

const INVITATION_COLUMNS: &str = r#"
    id, workspace_id, email, token, link_token, type, target_id, role, permission,
    permissions, inviter_id, invitee_user_id, status, method, expires_at, max_uses,
    use_count, reminder_count, last_sent_at, accepted_at, declined_at, cancelled_at,
    created_at, updated_at
"#;

/// Repository for invitation rows.
///
/// Every status transition is a single `UPDATE ... WHERE status = 'pending'
/// RETURNING ...`. A `None` result means another caller already moved the row
/// out of `pending` (or it never existed); callers re-read to report why.
pub struct InvitationRepository;

impl InvitationRepository {
    pub async fn insert<'e, E>(executor: E, new: NewInvitation) -> AppResult<Invitation>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let permissions = new
            .permissions
            .map(|p| serde_json::to_string(&p))
            .transpose()
            .map_err(|e| AppError::Internal(e.into()))?;

        let sql = format!(
            r#"
            INSERT INTO invitations (
                id, workspace_id, email, token, link_token, type, target_id, role,
                permission, permissions, inviter_id, status, method, expires_at,
                max_uses, use_count, reminder_count, last_sent_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING {INVITATION_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Invitation>(&sql)
            .bind(id)
            .bind(new.workspace_id)
            .bind(new.email)
            .bind(new.token)
            .bind(new.link_token)
            .bind(new.invitation_type)
            .bind(new.target_id)
            .bind(new.role)
            .bind(new.permission)
            .bind(permissions)
            .bind(new.inviter_id)
            .bind(new.method)
            .bind(new.expires_at)
            .bind(new.max_uses)
            .bind(new.use_count)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| AppError::from_insert(e, "pending invitation for this email"))
    }

    pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = ?");
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_token<'e, E>(executor: E, token: &str) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE token = ?");
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(token)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_for_target<'e, E>(
        executor: E,
        invitation_type: EntityType,
        target_id: &str,
    ) -> AppResult<Vec<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE type = ? AND target_id = ? ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(invitation_type)
            .bind(target_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_pending_for_email<'e, E>(executor: E, email: &str) -> AppResult<Vec<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE email = ? AND status = 'pending' ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(email)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// pending -> accepted, binding the invitee.
    pub async fn mark_accepted<'e, E>(
        executor: E,
        id: &str,
        invitee_user_id: &str,
    ) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE invitations
            SET status = 'accepted', accepted_at = ?, invitee_user_id = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {INVITATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(now)
            .bind(invitee_user_id)
            .bind(now)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// pending -> declined.
    pub async fn mark_declined<'e, E>(
        executor: E,
        id: &str,
        invitee_user_id: &str,
    ) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE invitations
            SET status = 'declined', declined_at = ?, invitee_user_id = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {INVITATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(now)
            .bind(invitee_user_id)
            .bind(now)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// pending -> cancelled / revoked / expired.
    pub async fn mark_closed<'e, E>(
        executor: E,
        id: &str,
        status: InvitationStatus,
    ) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if !matches!(
            status,
            InvitationStatus::Cancelled | InvitationStatus::Revoked | InvitationStatus::Expired
        ) {
            return Err(AppError::InvalidInput(format!(
                "{} is not a closing status",
                status.as_str()
            )));
        }

        let now = Utc::now().naive_utc();
        let cancelled_at = (status != InvitationStatus::Expired).then_some(now);
        let sql = format!(
            r#"
            UPDATE invitations
            SET status = ?, cancelled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {INVITATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(status)
            .bind(cancelled_at)
            .bind(now)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Replace the token of a pending invitation. The old token stops
    /// resolving the moment this commits. `reminder` also bumps the reminder
    /// counter and `last_sent_at`.
    pub async fn rotate_token<'e, E>(
        executor: E,
        id: &str,
        new_token: &str,
        expires_at: Option<NaiveDateTime>,
        reminder: bool,
    ) -> AppResult<Option<Invitation>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE invitations
            SET token = ?,
                expires_at = ?,
                reminder_count = reminder_count + ?,
                last_sent_at = COALESCE(?, last_sent_at),
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {INVITATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Invitation>(&sql)
            .bind(new_token)
            .bind(expires_at)
            .bind(i64::from(reminder))
            .bind(reminder.then_some(now))
            .bind(now)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Flip every overdue pending invitation to `expired`. Returns the count.
    pub async fn expire_overdue<'e, E>(executor: E, now: NaiveDateTime) -> AppResult<u64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET status = 'expired', updated_at = ?
            WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Retire an overdue pending invitation for one (target, email) so a new
    /// one can take its slot in the pending-email index.
    pub async fn expire_overdue_for<'e, E>(
        executor: E,
        kind: EntityType,
        target_id: &str,
        email: &str,
        now: NaiveDateTime,
    ) -> AppResult<u64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET status = 'expired', updated_at = ?
            WHERE type = ? AND target_id = ? AND email = ?
              AND status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(kind)
        .bind(target_id)
        .bind(email)
        .bind(now)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
