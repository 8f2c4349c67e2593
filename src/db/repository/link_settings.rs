use chrono::{NaiveDateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::db::models::{CreateLinkSettings, EntityType, InvitationLinkSettings};
use crate::error::{AppError, AppResult};

const LINK_COLUMNS: &str = r#"
    id, workspace_id, type, target_id, link_token, role, permission, is_active,
    requires_approval, allowed_domains, blocked_domains, max_uses, use_count,
    expires_at, created_by, created_at, updated_at
"#;

pub struct LinkSettingsRepository;

impl LinkSettingsRepository {
    pub async fn insert<'e, E>(
        executor: E,
        settings: &CreateLinkSettings,
        link_token: &str,
        created_by: &str,
    ) -> AppResult<InvitationLinkSettings>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let allowed = serde_json::to_string(&settings.allowed_domains)
            .map_err(|e| AppError::Internal(e.into()))?;
        let blocked = serde_json::to_string(&settings.blocked_domains)
            .map_err(|e| AppError::Internal(e.into()))?;

        let sql = format!(
            r#"
            INSERT INTO invitation_link_settings (
                id, workspace_id, type, target_id, link_token, role, permission,
                is_active, requires_approval, allowed_domains, blocked_domains,
                max_uses, use_count, expires_at, created_by, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            RETURNING {LINK_COLUMNS}
            "#
        );

        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(id)
            .bind(&settings.workspace_id)
            .bind(settings.link_type)
            .bind(&settings.target_id)
            .bind(link_token)
            .bind(settings.role)
            .bind(settings.permission)
            .bind(settings.requires_approval)
            .bind(allowed)
            .bind(blocked)
            .bind(settings.max_uses)
            .bind(settings.expires_at)
            .bind(created_by)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| AppError::from_insert(e, "active link for this target"))
    }

    /// Deactivate whatever link is currently active for a target.
    pub async fn deactivate_for_target<'e, E>(
        executor: E,
        workspace_id: &str,
        link_type: EntityType,
        target_id: &str,
    ) -> AppResult<u64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE invitation_link_settings
            SET is_active = 0, updated_at = ?
            WHERE workspace_id = ? AND type = ? AND target_id = ? AND is_active = 1
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(workspace_id)
        .bind(link_type)
        .bind(target_id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    pub async fn find_by_token<'e, E>(
        executor: E,
        link_token: &str,
    ) -> AppResult<Option<InvitationLinkSettings>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {LINK_COLUMNS} FROM invitation_link_settings WHERE link_token = ?");
        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(link_token)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AppResult<Option<InvitationLinkSettings>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {LINK_COLUMNS} FROM invitation_link_settings WHERE id = ?");
        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_active_for_target<'e, E>(
        executor: E,
        workspace_id: &str,
        link_type: EntityType,
        target_id: &str,
    ) -> AppResult<Option<InvitationLinkSettings>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM invitation_link_settings \
             WHERE workspace_id = ? AND type = ? AND target_id = ? AND is_active = 1"
        );
        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(workspace_id)
            .bind(link_type)
            .bind(target_id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn deactivate<'e, E>(executor: E, id: &str) -> AppResult<Option<InvitationLinkSettings>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            r#"
            UPDATE invitation_link_settings
            SET is_active = 0, updated_at = ?
            WHERE id = ?
            RETURNING {LINK_COLUMNS}
            "#
        );
        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Claim one use of the link. The quota check and the increment are one
    /// statement, so `max_uses` concurrent claims succeed at most `max_uses`
    /// times in total. `None` means the link is inactive, expired at `now` or
    /// exhausted.
    pub async fn try_consume<'e, E>(
        executor: E,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<InvitationLinkSettings>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            r#"
            UPDATE invitation_link_settings
            SET use_count = use_count + 1, updated_at = ?
            WHERE id = ?
              AND is_active = 1
              AND (expires_at IS NULL OR expires_at > ?)
              AND (max_uses IS NULL OR use_count < max_uses)
            RETURNING {LINK_COLUMNS}
            "#
        );
        sqlx::query_as::<_, InvitationLinkSettings>(&sql)
            .bind(now)
            .bind(id)
            .bind(now)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }
}
