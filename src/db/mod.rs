pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

/// In-memory database with the schema applied, for unit tests.
///
/// A single connection keeps every query on the same in-memory database, so
/// work on it is serialized. Race tests use
/// `services::test_support::shared_setup` instead.
#[cfg(test)]
pub async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    pool
}
