use std::collections::{HashMap, HashSet};

use sqlx::SqlitePool;

use crate::db::{
    AccessInfo, AccessOrigin, EffectiveAccess, EffectiveMember, EntityRecord, EntityRef,
    EntityRepository, EntityType, MembershipRepository, Role, UserRepository, Visibility,
};
use crate::error::{AppError, AppResult};
use crate::services::hierarchy::HierarchyResolver;

/// Bound on in-memory parent walks during reverse queries.
const MAX_DEPTH: usize = 5;

fn admits(node: &EntityRecord, user_id: &str, team_ids: &[String]) -> bool {
    node.visibility == Visibility::Public || node.is_allow_listed(user_id, team_ids.iter())
}

/// Core decision over a loaded path (entity first, workspace last) and the
/// user's direct role on each node of it.
///
/// 1. A direct role on the entity wins outright.
/// 2. Otherwise the nearest ancestor with a role supplies it, provided every
///    node below that ancestor admits the user. Owner and admin grants are
///    not stopped by `restricted` nodes.
/// 3. Otherwise a place on the entity's allow-lists grants `member`.
pub(crate) fn decide(
    path: &[&EntityRecord],
    roles: &[Option<Role>],
    user_id: &str,
    team_ids: &[String],
) -> Option<EffectiveAccess> {
    for (depth, (node, role)) in path.iter().zip(roles).enumerate() {
        let Some(role) = *role else {
            continue;
        };

        if depth == 0 {
            return Some(EffectiveAccess {
                role,
                origin: AccessOrigin::Direct,
            });
        }

        if role.bypasses_restrictions()
            || path[..depth].iter().all(|n| admits(n, user_id, team_ids))
        {
            return Some(EffectiveAccess {
                role,
                origin: AccessOrigin::Inherited {
                    from: node.entity_ref(),
                },
            });
        }
    }

    path.first()
        .filter(|entity| entity.is_allow_listed(user_id, team_ids.iter()))
        .map(|_| EffectiveAccess {
            role: Role::Member,
            origin: AccessOrigin::AllowList,
        })
}

/// Rebuild a path from records already loaded in memory.
fn path_in<'a>(
    records: &'a HashMap<EntityRef, EntityRecord>,
    start: &EntityRef,
) -> AppResult<Vec<&'a EntityRecord>> {
    let mut path = Vec::new();
    let mut next = Some(start.clone());

    while let Some(current) = next {
        if path.len() >= MAX_DEPTH {
            return Err(AppError::Internal(anyhow::anyhow!(
                "hierarchy above {start} is deeper than {MAX_DEPTH} levels"
            )));
        }
        let record = records.get(&current).ok_or_else(|| {
            AppError::NotFound(format!("{current} referenced by {start} not found"))
        })?;
        next = record.parent.clone();
        path.push(record);
    }

    Ok(path)
}

/// Answers "can user U act on entity E, at what role, and why".
///
/// Holds no state beyond its handles; every decision reads the store.
#[derive(Clone)]
pub struct AccessResolver {
    pool: SqlitePool,
    hierarchy: HierarchyResolver,
}

impl AccessResolver {
    pub fn new(pool: SqlitePool, hierarchy: HierarchyResolver) -> Self {
        Self { pool, hierarchy }
    }

    pub fn hierarchy(&self) -> &HierarchyResolver {
        &self.hierarchy
    }

    async fn direct_roles(&self, path: &[EntityRecord], user_id: &str) -> AppResult<Vec<Option<Role>>> {
        let mut roles = Vec::with_capacity(path.len());
        for node in path {
            let role = match node.entity_type.member_table() {
                Some(_) => {
                    MembershipRepository::find(&self.pool, node.entity_type, &node.id, user_id)
                        .await?
                        .map(|m| m.role)
                }
                None => None,
            };
            roles.push(role);
        }
        Ok(roles)
    }

    async fn resolve(
        &self,
        entity: &EntityRef,
        user_id: &str,
    ) -> AppResult<(EntityRecord, Option<EffectiveAccess>)> {
        let mut path = self.hierarchy.load_path(entity).await?;
        let roles = self.direct_roles(&path, user_id).await?;
        let team_ids = MembershipRepository::team_ids_for_user(&self.pool, user_id).await?;

        let refs: Vec<&EntityRecord> = path.iter().collect();
        let access = decide(&refs, &roles, user_id, &team_ids);
        tracing::debug!(
            %entity,
            user_id,
            role = ?access.as_ref().map(|a| a.role),
            origin = ?access.as_ref().map(|a| a.origin.key()),
            "Resolved effective access"
        );

        // load_path never returns an empty path
        let record = path.swap_remove(0);
        Ok((record, access))
    }

    /// `GetAccessLevel`: role and origin, or `None` when access is denied.
    pub async fn get_access_level(
        &self,
        entity: &EntityRef,
        user_id: &str,
    ) -> AppResult<Option<EffectiveAccess>> {
        Ok(self.resolve(entity, user_id).await?.1)
    }

    pub async fn has_effective_access(&self, entity: &EntityRef, user_id: &str) -> AppResult<bool> {
        Ok(self.get_access_level(entity, user_id).await?.is_some())
    }

    /// Access or `Unauthorized`.
    pub async fn require_access(&self, entity: &EntityRef, user_id: &str) -> AppResult<EffectiveAccess> {
        self.get_access_level(entity, user_id)
            .await?
            .ok_or(AppError::Unauthorized)
    }

    /// Access with a role able to edit content, or `Forbidden`.
    pub async fn require_editor(&self, entity: &EntityRef, user_id: &str) -> AppResult<EffectiveAccess> {
        let access = self.require_access(entity, user_id).await?;
        if !access.role.can_edit() {
            return Err(AppError::Forbidden(format!(
                "role {} cannot edit {entity}",
                access.role
            )));
        }
        Ok(access)
    }

    /// Access with a role able to manage members, or `Forbidden`.
    pub async fn require_manager(&self, entity: &EntityRef, user_id: &str) -> AppResult<EffectiveAccess> {
        let access = self.require_access(entity, user_id).await?;
        if !access.role.can_manage_members() {
            return Err(AppError::Forbidden(format!(
                "role {} cannot manage members of {entity}",
                access.role
            )));
        }
        Ok(access)
    }

    pub async fn get_access_info(&self, entity: &EntityRef, user_id: &str) -> AppResult<AccessInfo> {
        let (record, access) = self.resolve(entity, user_id).await?;
        let role = access.as_ref().map(|a| a.role);

        Ok(AccessInfo {
            entity: record.entity_ref(),
            workspace_id: record.workspace_id,
            user_id: user_id.to_string(),
            has_access: access.is_some(),
            role,
            is_direct: access.as_ref().is_some_and(|a| a.origin.is_direct()),
            origin: access.map(|a| a.origin),
            can_edit: role.is_some_and(Role::can_edit),
            can_manage_members: role.is_some_and(Role::can_manage_members),
        })
    }

    /// Users holding a membership row on the entity itself.
    pub async fn list_direct_members(&self, entity: &EntityRef) -> AppResult<Vec<EffectiveMember>> {
        self.hierarchy.entity(entity).await?;
        let memberships =
            MembershipRepository::list_for_entity(&self.pool, entity.entity_type, &entity.id).await?;

        let ids: Vec<String> = memberships.iter().map(|m| m.user_id.clone()).collect();
        let users: HashMap<String, _> = UserRepository::find_many(&self.pool, &ids)
            .await?
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();

        Ok(memberships
            .into_iter()
            .filter_map(|m| {
                let user = users.get(&m.user_id)?;
                Some(EffectiveMember {
                    user_id: m.user_id,
                    email: user.email.clone(),
                    display_name: user.display_name.clone(),
                    role: m.role,
                    origin: AccessOrigin::Direct,
                })
            })
            .collect())
    }

    /// Every user with effective access on the entity: direct members, members
    /// of ancestors whose grant reaches down, and allow-listed users.
    pub async fn list_effective_members(&self, entity: &EntityRef) -> AppResult<Vec<EffectiveMember>> {
        let path = self.hierarchy.load_path(entity).await?;

        let mut grants: Vec<HashMap<String, Role>> = Vec::with_capacity(path.len());
        let mut candidates: HashSet<String> = HashSet::new();
        for node in &path {
            let mut by_user = HashMap::new();
            if node.entity_type.member_table().is_some() {
                for m in
                    MembershipRepository::list_for_entity(&self.pool, node.entity_type, &node.id)
                        .await?
                {
                    candidates.insert(m.user_id.clone());
                    by_user.insert(m.user_id, m.role);
                }
            }
            grants.push(by_user);
        }

        if let Some(target) = path.first() {
            candidates.extend(target.allowed_users.iter().cloned());
            candidates
                .extend(MembershipRepository::team_member_ids(&self.pool, &target.allowed_teams).await?);
        }

        let uses_teams = path.iter().any(|n| !n.allowed_teams.is_empty());
        let refs: Vec<&EntityRecord> = path.iter().collect();
        let mut decided: HashMap<String, EffectiveAccess> = HashMap::new();
        for user_id in candidates {
            let team_ids = if uses_teams {
                MembershipRepository::team_ids_for_user(&self.pool, &user_id).await?
            } else {
                Vec::new()
            };
            let roles: Vec<Option<Role>> = grants.iter().map(|g| g.get(&user_id).copied()).collect();
            if let Some(access) = decide(&refs, &roles, &user_id, &team_ids) {
                decided.insert(user_id, access);
            }
        }

        let ids: Vec<String> = decided.keys().cloned().collect();
        let mut members: Vec<EffectiveMember> = UserRepository::find_many(&self.pool, &ids)
            .await?
            .into_iter()
            .filter_map(|user| {
                let access = decided.remove(&user.id)?;
                Some(EffectiveMember {
                    user_id: user.id,
                    email: user.email,
                    display_name: user.display_name,
                    role: access.role,
                    origin: access.origin,
                })
            })
            .collect();

        members.sort_by(|a, b| b.role.cmp_rank(a.role).then_with(|| a.email.cmp(&b.email)));
        Ok(members)
    }

    /// Reverse query: every entity of `kind` the user can reach.
    ///
    /// Loads the candidate workspaces' rows and the user's memberships once,
    /// then runs the same decision as a single lookup for every row.
    pub async fn get_accessible(&self, kind: EntityType, user_id: &str) -> AppResult<Vec<EntityRecord>> {
        let chain: &[EntityType] = match kind {
            EntityType::Workspace => &[EntityType::Workspace],
            EntityType::Space => &[EntityType::Workspace, EntityType::Space],
            EntityType::Folder => &[EntityType::Workspace, EntityType::Space, EntityType::Folder],
            EntityType::Project => &[
                EntityType::Workspace,
                EntityType::Space,
                EntityType::Folder,
                EntityType::Project,
            ],
            other => {
                return Err(AppError::InvalidEntityType(format!(
                    "no reverse query for {other}"
                )))
            }
        };

        let workspace_ids = EntityRepository::workspace_scope_for_user(&self.pool, user_id).await?;
        if workspace_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut records: HashMap<EntityRef, EntityRecord> = HashMap::new();
        let mut roles: HashMap<EntityRef, Role> = HashMap::new();
        let mut targets: Vec<EntityRef> = Vec::new();
        for &level in chain {
            for record in EntityRepository::list_in_workspaces(&self.pool, level, &workspace_ids).await? {
                if level == kind {
                    targets.push(record.entity_ref());
                }
                records.insert(record.entity_ref(), record);
            }
            for m in MembershipRepository::list_for_user(&self.pool, level, user_id).await? {
                roles.insert(EntityRef::new(level, m.entity_id), m.role);
            }
        }
        let team_ids = MembershipRepository::team_ids_for_user(&self.pool, user_id).await?;

        let mut accessible = Vec::new();
        for target in &targets {
            let path = path_in(&records, target)?;
            let path_roles: Vec<Option<Role>> = path
                .iter()
                .map(|n| roles.get(&n.entity_ref()).copied())
                .collect();
            if decide(&path, &path_roles, user_id, &team_ids).is_some() {
                accessible.push(path[0].clone());
            }
        }

        tracing::debug!(user_id, %kind, count = accessible.len(), "Resolved accessible entities");
        Ok(accessible)
    }

    pub async fn get_accessible_workspaces(&self, user_id: &str) -> AppResult<Vec<EntityRecord>> {
        self.get_accessible(EntityType::Workspace, user_id).await
    }

    pub async fn get_accessible_spaces(&self, user_id: &str) -> AppResult<Vec<EntityRecord>> {
        self.get_accessible(EntityType::Space, user_id).await
    }

    pub async fn get_accessible_folders(&self, user_id: &str) -> AppResult<Vec<EntityRecord>> {
        self.get_accessible(EntityType::Folder, user_id).await
    }

    pub async fn get_accessible_projects(&self, user_id: &str) -> AppResult<Vec<EntityRecord>> {
        self.get_accessible(EntityType::Project, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::*;

    fn ids(records: &[EntityRecord]) -> Vec<&str> {
        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    fn sorted<'a>(mut ids: Vec<&'a str>) -> Vec<&'a str> {
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn workspace_owner_inherits_down_the_tree() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let ws = workspace(&pool, &owner).await;
        let s = space(&pool, &ws).await;
        let f = folder(&pool, &s).await;
        let p = project(&pool, &s, Some(&f)).await;
        let t = task(&pool, &p).await;

        for entity in [&s, &f, &p, &t] {
            let level = access
                .get_access_level(&entity.entity_ref(), &owner.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(level.role, Role::Owner);
            assert_eq!(
                level.origin,
                AccessOrigin::Inherited {
                    from: ws.entity_ref()
                }
            );
            assert_eq!(level.origin.key(), format!("workspace:{}", ws.id));
        }
    }

    #[tokio::test]
    async fn nearest_ancestor_supplies_the_role() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let u = user(&pool, "u@example.com").await;
        let ws = workspace(&pool, &owner).await;
        let s = space(&pool, &ws).await;
        let p = project(&pool, &s, None).await;
        grant(&pool, &ws, &u, Role::Admin).await;
        grant(&pool, &s, &u, Role::Guest).await;

        // Space grant is nearer than the workspace grant, even though it ranks lower.
        let level = access
            .get_access_level(&p.entity_ref(), &u.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.role, Role::Guest);
        assert_eq!(
            level.origin,
            AccessOrigin::Inherited {
                from: s.entity_ref()
            }
        );
    }

    #[tokio::test]
    async fn direct_membership_beats_inherited() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let u = user(&pool, "u@example.com").await;
        let ws = workspace(&pool, &owner).await;
        let s = space(&pool, &ws).await;
        let p = project(&pool, &s, None).await;
        grant(&pool, &ws, &u, Role::Admin).await;
        grant(&pool, &p, &u, Role::LimitedMember).await;

        let level = access
            .get_access_level(&p.entity_ref(), &u.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.role, Role::LimitedMember);
        assert_eq!(level.origin, AccessOrigin::Direct);
        assert_eq!(level.origin.key(), "");
    }

    #[tokio::test]
    async fn outsiders_are_denied() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let stranger = user(&pool, "stranger@example.com").await;
        let ws = workspace(&pool, &owner).await;
        let s = space(&pool, &ws).await;

        assert!(!access
            .has_effective_access(&s.entity_ref(), &stranger.id)
            .await
            .unwrap());
        assert!(matches!(
            access.require_access(&s.entity_ref(), &stranger.id).await,
            Err(AppError::Unauthorized)
        ));

        let info = access
            .get_access_info(&s.entity_ref(), &stranger.id)
            .await
            .unwrap();
        assert!(!info.has_access);
        assert!(info.role.is_none() && info.origin.is_none());
        assert_eq!(info.workspace_id, ws.id);
    }

    #[tokio::test]
    async fn restricted_entities_gate_inherited_member_grants() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let admin = user(&pool, "admin@example.com").await;
        let member = user(&pool, "member@example.com").await;
        let listed = user(&pool, "listed@example.com").await;
        let via_team = user(&pool, "team@example.com").await;
        let outsider = user(&pool, "outsider@example.com").await;

        let ws = workspace(&pool, &owner).await;
        grant(&pool, &ws, &admin, Role::Admin).await;
        grant(&pool, &ws, &member, Role::Member).await;
        grant(&pool, &ws, &listed, Role::Member).await;
        grant(&pool, &ws, &via_team, Role::Member).await;
        let crew = team(&pool, &ws, &[&via_team]).await;

        let s = space(&pool, &ws).await;
        let s = restrict(&pool, &s, &[&listed, &outsider], &[&crew]).await;
        let s_ref = s.entity_ref();

        // admin grants see through the restriction
        let level = access.get_access_level(&s_ref, &admin.id).await.unwrap().unwrap();
        assert_eq!(level.role, Role::Admin);

        // plain members need a place on the allow-lists
        assert!(access.get_access_level(&s_ref, &member.id).await.unwrap().is_none());

        let level = access.get_access_level(&s_ref, &listed.id).await.unwrap().unwrap();
        assert_eq!(level.role, Role::Member);
        assert_eq!(level.origin, AccessOrigin::Inherited { from: ws.entity_ref() });

        let level = access.get_access_level(&s_ref, &via_team.id).await.unwrap().unwrap();
        assert!(!level.origin.is_direct());

        // allow-listed without any membership
        let level = access.get_access_level(&s_ref, &outsider.id).await.unwrap().unwrap();
        assert_eq!(level.role, Role::Member);
        assert_eq!(level.origin, AccessOrigin::AllowList);
    }

    #[tokio::test]
    async fn restricted_intermediate_node_blocks_descendants() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let member = user(&pool, "member@example.com").await;
        let insider = user(&pool, "insider@example.com").await;

        let ws = workspace(&pool, &owner).await;
        grant(&pool, &ws, &member, Role::Member).await;
        let s = space(&pool, &ws).await;
        let f = folder(&pool, &s).await;
        let f = restrict(&pool, &f, &[], &[]).await;
        grant(&pool, &f, &insider, Role::Member).await;
        let p = project(&pool, &s, Some(&f)).await;

        assert!(access
            .get_access_level(&p.entity_ref(), &member.id)
            .await
            .unwrap()
            .is_none());

        // Granted on the restricted folder itself: nothing between it and the project.
        let level = access
            .get_access_level(&p.entity_ref(), &insider.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.origin, AccessOrigin::Inherited { from: f.entity_ref() });

        // The owner is unaffected.
        assert!(access.has_effective_access(&p.entity_ref(), &owner.id).await.unwrap());
    }

    #[tokio::test]
    async fn effective_and_direct_member_lists() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let member = user(&pool, "member@example.com").await;
        let guest = user(&pool, "guest@example.com").await;
        let listed = user(&pool, "listed@example.com").await;

        let ws = workspace(&pool, &owner).await;
        grant(&pool, &ws, &member, Role::Member).await;
        grant(&pool, &ws, &guest, Role::Member).await;
        let s = space(&pool, &ws).await;
        grant(&pool, &s, &guest, Role::Guest).await;
        let p = project(&pool, &s, None).await;
        let mut overlay = crate::db::UpdateVisibility {
            visibility: Visibility::Public,
            allowed_users: vec![listed.id.clone()],
            allowed_teams: vec![],
        };
        EntityRepository::update_visibility(&pool, &p.entity_ref(), &overlay)
            .await
            .unwrap();

        let members = access.list_effective_members(&p.entity_ref()).await.unwrap();
        let by_email: HashMap<&str, &EffectiveMember> =
            members.iter().map(|m| (m.email.as_str(), m)).collect();
        assert_eq!(members.len(), 4);
        assert_eq!(members[0].email, "owner@example.com");
        assert_eq!(by_email["member@example.com"].role, Role::Member);
        assert_eq!(by_email["guest@example.com"].role, Role::Guest);
        assert_eq!(
            by_email["guest@example.com"].origin,
            AccessOrigin::Inherited { from: s.entity_ref() }
        );
        assert_eq!(by_email["listed@example.com"].origin, AccessOrigin::AllowList);

        let direct = access.list_direct_members(&s.entity_ref()).await.unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].user_id, guest.id);
        assert!(direct[0].origin.is_direct());

        // Restricting the project drops the plain workspace member.
        overlay.visibility = Visibility::Restricted;
        EntityRepository::update_visibility(&pool, &p.entity_ref(), &overlay)
            .await
            .unwrap();
        let members = access.list_effective_members(&p.entity_ref()).await.unwrap();
        assert!(members.iter().all(|m| m.user_id != member.id));
        assert!(members.iter().any(|m| m.user_id == owner.id));
    }

    #[tokio::test]
    async fn reverse_queries_follow_the_same_rules() {
        let (pool, access) = setup().await;
        let owner = user(&pool, "owner@example.com").await;
        let member = user(&pool, "member@example.com").await;
        let contractor = user(&pool, "contractor@example.com").await;

        let ws = workspace(&pool, &owner).await;
        grant(&pool, &ws, &member, Role::Member).await;
        let open = space(&pool, &ws).await;
        let closed = space(&pool, &ws).await;
        let closed = restrict(&pool, &closed, &[], &[]).await;
        let f = folder(&pool, &open).await;
        let p_open = project(&pool, &open, Some(&f)).await;
        let p_closed = project(&pool, &closed, None).await;
        grant(&pool, &p_closed, &contractor, Role::Member).await;

        let spaces = access.get_accessible_spaces(&owner.id).await.unwrap();
        assert_eq!(ids(&spaces), sorted(vec![open.id.as_str(), closed.id.as_str()]));

        let spaces = access.get_accessible_spaces(&member.id).await.unwrap();
        assert_eq!(ids(&spaces), vec![open.id.as_str()]);

        let folders = access.get_accessible_folders(&member.id).await.unwrap();
        assert_eq!(ids(&folders), vec![f.id.as_str()]);

        let projects = access.get_accessible_projects(&member.id).await.unwrap();
        assert_eq!(ids(&projects), vec![p_open.id.as_str()]);

        // A direct project grant reaches the project but nothing above it.
        let projects = access.get_accessible_projects(&contractor.id).await.unwrap();
        assert_eq!(ids(&projects), vec![p_closed.id.as_str()]);
        assert!(access.get_accessible_spaces(&contractor.id).await.unwrap().is_empty());
        assert!(access
            .get_accessible_workspaces(&contractor.id)
            .await
            .unwrap()
            .is_empty());

        let workspaces = access.get_accessible_workspaces(&member.id).await.unwrap();
        assert_eq!(ids(&workspaces), vec![ws.id.as_str()]);
    }

    #[tokio::test]
    async fn tasks_have_no_reverse_query() {
        let (_pool, access) = setup().await;
        assert!(matches!(
            access.get_accessible(EntityType::Task, "u").await,
            Err(AppError::InvalidEntityType(_))
        ));
    }
}
