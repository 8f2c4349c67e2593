//! Fixtures shared by the service tests.

use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::db::{
    test_pool, CreateEntity, EntityRecord, EntityRepository, EntityType, Membership,
    MembershipRepository, Role, UpdateVisibility, User, UserRepository, Visibility,
};
use crate::config::Config;
use crate::services::access::AccessResolver;
use crate::services::hierarchy::HierarchyResolver;
use crate::services::init::init_db;

pub async fn setup() -> (SqlitePool, AccessResolver) {
    let pool = test_pool().await;
    let access = AccessResolver::new(pool.clone(), HierarchyResolver::new(pool.clone()));
    (pool, access)
}

/// File-backed WAL database opened by `init_db` with several connections, so
/// concurrent callers run on separate connections. Keep the `TempDir` alive
/// for as long as the pool.
pub async fn shared_setup() -> (SqlitePool, AccessResolver, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database.url = dir.path().join("access.db").display().to_string();
    config.database.max_connections = 8;

    let pool = init_db(&config).await.unwrap();
    let access = AccessResolver::new(pool.clone(), HierarchyResolver::new(pool.clone()));
    (pool, access, dir)
}

pub async fn owner_count(pool: &SqlitePool, workspace_id: &str) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workspace_members WHERE workspace_id = ? AND role = 'owner'")
        .bind(workspace_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn user(pool: &SqlitePool, email: &str) -> User {
    let name = email.split('@').next().unwrap_or(email);
    UserRepository::create(pool, email, name).await.unwrap()
}

/// Workspace with `owner` as its only owner.
pub async fn workspace(pool: &SqlitePool, owner: &User) -> EntityRecord {
    let ws = EntityRepository::create_workspace(pool, "Acme", &owner.id)
        .await
        .unwrap();
    MembershipRepository::insert(pool, EntityType::Workspace, &ws.id, &owner.id, Role::Owner)
        .await
        .unwrap();
    ws
}

fn child(name: &str, parent_id: &str, folder_id: Option<&str>) -> CreateEntity {
    CreateEntity {
        name: name.to_string(),
        parent_id: parent_id.to_string(),
        folder_id: folder_id.map(str::to_string),
        visibility: Visibility::Public,
        allowed_users: vec![],
        allowed_teams: vec![],
    }
}

pub async fn space(pool: &SqlitePool, ws: &EntityRecord) -> EntityRecord {
    EntityRepository::create_child(pool, EntityType::Space, &ws.id, None, &child("Space", &ws.id, None))
        .await
        .unwrap()
}

pub async fn folder(pool: &SqlitePool, space: &EntityRecord) -> EntityRecord {
    EntityRepository::create_child(
        pool,
        EntityType::Folder,
        &space.workspace_id,
        None,
        &child("Folder", &space.id, None),
    )
    .await
    .unwrap()
}

pub async fn project(
    pool: &SqlitePool,
    space: &EntityRecord,
    folder: Option<&EntityRecord>,
) -> EntityRecord {
    EntityRepository::create_child(
        pool,
        EntityType::Project,
        &space.workspace_id,
        Some(space.id.as_str()),
        &child("Project", &space.id, folder.map(|f| f.id.as_str())),
    )
    .await
    .unwrap()
}

pub async fn task(pool: &SqlitePool, project: &EntityRecord) -> EntityRecord {
    EntityRepository::create_child(
        pool,
        EntityType::Task,
        &project.workspace_id,
        None,
        &child("Task", &project.id, None),
    )
    .await
    .unwrap()
}

pub async fn team(pool: &SqlitePool, ws: &EntityRecord, members: &[&User]) -> EntityRecord {
    let team = EntityRepository::create_team(pool, &ws.id, "Team").await.unwrap();
    for member in members {
        grant(pool, &team, member, Role::Member).await;
    }
    team
}

pub async fn grant(pool: &SqlitePool, entity: &EntityRecord, user: &User, role: Role) -> Membership {
    MembershipRepository::insert(pool, entity.entity_type, &entity.id, &user.id, role)
        .await
        .unwrap()
}

/// Mark an entity restricted with the given allow-lists.
pub async fn restrict(
    pool: &SqlitePool,
    entity: &EntityRecord,
    users: &[&User],
    teams: &[&EntityRecord],
) -> EntityRecord {
    let update = UpdateVisibility {
        visibility: Visibility::Restricted,
        allowed_users: users.iter().map(|u| u.id.clone()).collect(),
        allowed_teams: teams.iter().map(|t| t.id.clone()).collect(),
    };
    EntityRepository::update_visibility(pool, &entity.entity_ref(), &update)
        .await
        .unwrap()
        .unwrap()
}
