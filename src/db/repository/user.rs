use chrono::Utc;
use sqlx::{Executor, QueryBuilder, Sqlite};
use uuid::Uuid;

use crate::db::models::{normalize_email, User};
use crate::error::{AppError, AppResult};

// ============================================================================
// User Repository (identity collaborator)
// ============================================================================

pub struct UserRepository;

impl UserRepository {
    pub async fn create<'e, E>(executor: E, email: &str, display_name: &str) -> AppResult<User>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, email, display_name, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(normalize_email(email))
        .bind(display_name)
        .bind(now)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(|e| AppError::from_insert(e, "user"))
    }

    pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AppResult<Option<User>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> AppResult<Option<User>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, created_at, updated_at FROM users WHERE email = ?",
        )
        .bind(normalize_email(email))
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_many<'e, E>(executor: E, ids: &[String]) -> AppResult<Vec<User>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, email, display_name, created_at, updated_at FROM users WHERE id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");

        qb.build_query_as::<User>()
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }
}
