use chrono::Utc;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::db::models::{EntityType, Membership, Role};
use crate::error::{AppError, AppResult};

// ============================================================================
// Membership Store
// ============================================================================

/// Direct grants, one table per entity kind. Table and column names come from
/// [`EntityType::member_table`] and are never caller-supplied.
pub struct MembershipRepository;

fn table_for(kind: EntityType) -> AppResult<(&'static str, &'static str)> {
    kind.member_table().ok_or_else(|| {
        AppError::InvalidEntityType(format!("{kind} does not hold direct memberships"))
    })
}

fn columns(kind: EntityType, fk: &str) -> String {
    format!(
        "id, '{}' AS entity_type, {fk} AS entity_id, user_id, role, created_at, updated_at",
        kind.as_str()
    )
}

impl MembershipRepository {
    pub async fn find<'e, E>(
        executor: E,
        kind: EntityType,
        entity_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Membership>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (table, fk) = table_for(kind)?;
        let sql = format!(
            "SELECT {} FROM {table} WHERE {fk} = ? AND user_id = ?",
            columns(kind, fk)
        );

        sqlx::query_as::<_, Membership>(&sql)
            .bind(entity_id)
            .bind(user_id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_for_entity<'e, E>(
        executor: E,
        kind: EntityType,
        entity_id: &str,
    ) -> AppResult<Vec<Membership>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (table, fk) = table_for(kind)?;
        let sql = format!(
            "SELECT {} FROM {table} WHERE {fk} = ? ORDER BY created_at ASC",
            columns(kind, fk)
        );

        sqlx::query_as::<_, Membership>(&sql)
            .bind(entity_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Every direct grant of one kind held by a user.
    pub async fn list_for_user<'e, E>(
        executor: E,
        kind: EntityType,
        user_id: &str,
    ) -> AppResult<Vec<Membership>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (table, fk) = table_for(kind)?;
        let sql = format!(
            "SELECT {} FROM {table} WHERE user_id = ?",
            columns(kind, fk)
        );

        sqlx::query_as::<_, Membership>(&sql)
            .bind(user_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Insert a grant. A second grant for the same (entity, user) is a `Conflict`.
    pub async fn insert<'e, E>(
        executor: E,
        kind: EntityType,
        entity_id: &str,
        user_id: &str,
        role: Role,
    ) -> AppResult<Membership>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if !kind.allows_role(role) {
            return Err(AppError::InvalidInput(format!(
                "role {role} is not valid for a {kind}"
            )));
        }

        let (table, fk) = table_for(kind)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let sql = format!(
            "INSERT INTO {table} (id, {fk}, user_id, role, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
            columns(kind, fk)
        );

        sqlx::query_as::<_, Membership>(&sql)
            .bind(id)
            .bind(entity_id)
            .bind(user_id)
            .bind(role)
            .bind(now)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|e| AppError::from_insert(e, "membership"))
    }

    /// Change a member's role unless doing so would leave the entity without
    /// an owner. The owner count and the write happen in one statement, so two
    /// concurrent demotions cannot both observe a second owner.
    ///
    /// Returns `None` when no row was written: either the member does not
    /// exist or the guard refused.
    pub async fn update_role_guarded<'e, E>(
        executor: E,
        kind: EntityType,
        entity_id: &str,
        user_id: &str,
        role: Role,
    ) -> AppResult<Option<Membership>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (table, fk) = table_for(kind)?;
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE {table} SET role = ?, updated_at = ?
            WHERE {fk} = ? AND user_id = ?
              AND (
                role <> 'owner'
                OR ? = 'owner'
                OR (SELECT COUNT(*) FROM {table} WHERE {fk} = ? AND role = 'owner') > 1
              )
            RETURNING {}
            "#,
            columns(kind, fk)
        );

        sqlx::query_as::<_, Membership>(&sql)
            .bind(role)
            .bind(now)
            .bind(entity_id)
            .bind(user_id)
            .bind(role)
            .bind(entity_id)
            .fetch_optional(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Delete a grant under the same last-owner guard. Returns whether a row
    /// was removed.
    pub async fn delete_guarded<'e, E>(
        executor: E,
        kind: EntityType,
        entity_id: &str,
        user_id: &str,
    ) -> AppResult<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (table, fk) = table_for(kind)?;
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE {fk} = ? AND user_id = ?
              AND (
                role <> 'owner'
                OR (SELECT COUNT(*) FROM {table} WHERE {fk} = ? AND role = 'owner') > 1
              )
            "#
        );

        let result = sqlx::query(&sql)
            .bind(entity_id)
            .bind(user_id)
            .bind(entity_id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Teams the user belongs to, for allow-list evaluation.
    pub async fn team_ids_for_user<'e, E>(executor: E, user_id: &str) -> AppResult<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, String>("SELECT team_id FROM team_members WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }

    /// Members of any of the given teams.
    pub async fn team_member_ids<'e, E>(executor: E, team_ids: &[String]) -> AppResult<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if team_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: sqlx::QueryBuilder<Sqlite> =
            sqlx::QueryBuilder::new("SELECT DISTINCT user_id FROM team_members WHERE team_id IN (");
        let mut ids = qb.separated(", ");
        for id in team_ids {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(")");

        qb.build_query_scalar::<String>()
            .fetch_all(executor)
            .await
            .map_err(AppError::Database)
    }
}
