use chrono::Utc;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::db::models::{AccessRequest, AccessRequestStatus, EntityType, Role};
use crate::error::{AppError, AppResult};

const REQUEST_COLUMNS: &str = r#"
    id, workspace_id, requester_id, email, type, target_id, role, message, status,
    processed_by, processed_at, denial_reason, created_at, updated_at
"#;

pub struct AccessRequestRepository;

impl AccessRequestRepository {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert<'e, E>(
        executor: E,
        workspace_id: &str,
        requester_id: &str,
        email: &str,
        request_type: EntityType,
        target_id: &str,
        role: Role,
        message: Option<&str>,
    ) -> AppResult<AccessRequest>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            INSERT INTO access_requests (
                id, workspace_id, requester_id, email, type, target_id, role, message,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            RETURNING {REQUEST_COLUMNS}
            "#
        );

        sqlx::query_as::<_, AccessRequest>(&sql)
            .bind(id)
            .bind(workspace_id)
            .bind(requester_id)
            .bind(email)
            .bind(request_type)
            .bind(target_id)
            .bind(role)
            .bind(message)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| AppError::from_insert(e, "pending access request"))
    }

    pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AppResult<Option<AccessRequest>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM access_requests WHERE id = ?");
        sqlx::query_as::<_, AccessRequest>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_pending_for_target<'e, E>(
        executor: E,
        request_type: EntityType,
        target_id: &str,
    ) -> AppResult<Vec<AccessRequest>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM access_requests \
             WHERE type = ? AND target_id = ? AND status = 'pending' ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, AccessRequest>(&sql)
            .bind(request_type)
            .bind(target_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// pending -> approved / denied. `None` when the request was already processed.
    pub async fn mark_processed<'e, E>(
        executor: E,
        id: &str,
        status: AccessRequestStatus,
        processed_by: &str,
        denial_reason: Option<&str>,
    ) -> AppResult<Option<AccessRequest>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if status == AccessRequestStatus::Pending {
            return Err(AppError::InvalidInput(
                "an access request cannot be moved back to pending".into(),
            ));
        }

        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE access_requests
            SET status = ?, processed_by = ?, processed_at = ?, denial_reason = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        sqlx::query_as::<_, AccessRequest>(&sql)
            .bind(status)
            .bind(processed_by)
            .bind(now)
            .bind(denial_reason)
            .bind(now)
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }
}
