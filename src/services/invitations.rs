use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db::{
    email_domain, may_assign, normalize_email, AccessRequest, AccessRequestRepository,
    CreateInvitation, CreateLinkSettings, EntityRecord, EntityRef, EntityType, Invitation,
    InvitationLinkSettings, InvitationMethod, InvitationPermissions, InvitationRepository,
    InvitationStatus, InviteRequest, LinkSettingsRepository, LinkState, Membership,
    MembershipRepository, NewInvitation, Role, User, UserRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::access::AccessResolver;
use crate::services::notifier::{InvitationNotice, InvitationNotifier};
use crate::services::tokens::generate_token;

/// Values the invitation engine takes from configuration.
#[derive(Debug, Clone)]
pub struct InvitationSettings {
    /// Public base URL; invite links are `{app_url}/invite/{token}`.
    pub app_url: String,
    /// Lifetime applied when a caller does not pick one. `None` disables expiry.
    pub default_ttl_hours: Option<i64>,
}

/// A freshly issued or re-issued invitation together with its link. The
/// token itself never leaves the service any other way.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvitation {
    pub invitation: Invitation,
    pub invite_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedInvitation {
    pub invitation: Invitation,
    pub membership: Membership,
    pub permissions: InvitationPermissions,
}

/// What redeeming a shareable link produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum LinkRedemption {
    Invitation(Invitation),
    AccessRequest(AccessRequest),
}

fn link_exhausted() -> AppError {
    AppError::Conflict("invitation link is inactive or has reached its usage limit".into())
}

fn normalize_domains(domains: &mut Vec<String>) {
    *domains = domains
        .iter()
        .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    domains.sort();
    domains.dedup();
}

/// Token invitations, shareable links and their state transitions.
#[derive(Clone)]
pub struct InvitationService {
    pool: SqlitePool,
    access: AccessResolver,
    notifier: Arc<dyn InvitationNotifier>,
    settings: InvitationSettings,
}

impl InvitationService {
    pub fn new(
        pool: SqlitePool,
        access: AccessResolver,
        notifier: Arc<dyn InvitationNotifier>,
        settings: InvitationSettings,
    ) -> Self {
        Self {
            pool,
            access,
            notifier,
            settings,
        }
    }

    pub fn invite_url(&self, token: &str) -> String {
        format!("{}/invite/{}", self.settings.app_url.trim_end_matches('/'), token)
    }

    fn issued(&self, invitation: Invitation) -> IssuedInvitation {
        IssuedInvitation {
            invite_url: self.invite_url(&invitation.token),
            invitation,
        }
    }

    fn expiry(&self, hours: Option<i64>) -> AppResult<Option<NaiveDateTime>> {
        match hours.or(self.settings.default_ttl_hours) {
            Some(h) if h <= 0 => Err(AppError::InvalidInput(
                "expires_in_hours must be positive".into(),
            )),
            Some(h) => Ok(Some(Utc::now().naive_utc() + Duration::hours(h))),
            None => Ok(None),
        }
    }

    /// Resolve the target and make sure it lives in the named workspace.
    async fn target_in_workspace(
        &self,
        workspace_id: &str,
        kind: EntityType,
        target_id: &str,
    ) -> AppResult<EntityRecord> {
        if !kind.is_invitable() {
            return Err(AppError::InvalidEntityType(format!(
                "cannot invite to a {kind}"
            )));
        }

        let target = self
            .access
            .hierarchy()
            .entity(&EntityRef::new(kind, target_id))
            .await?;
        if target.workspace_id != workspace_id {
            return Err(AppError::InvalidInput(format!(
                "{} does not belong to workspace {workspace_id}",
                target.entity_ref()
            )));
        }
        Ok(target)
    }

    /// Manager on the target who may hand out `role`.
    async fn require_inviter(&self, target: &EntityRef, actor_id: &str, role: Role) -> AppResult<()> {
        let actor = self.access.require_manager(target, actor_id).await?;
        if !may_assign(actor.role, None, role) {
            return Err(AppError::Forbidden(format!(
                "{} cannot invite as {role}",
                actor.role
            )));
        }
        Ok(())
    }

    async fn reject_existing_member(&self, kind: EntityType, target_id: &str, email: &str) -> AppResult<()> {
        if let Some(user) = UserRepository::find_by_email(&self.pool, email).await? {
            if MembershipRepository::find(&self.pool, kind, target_id, &user.id)
                .await?
                .is_some()
            {
                return Err(AppError::Conflict(format!(
                    "{email} is already a member of {kind}:{target_id}"
                )));
            }
        }
        Ok(())
    }

    async fn notify(&self, invitation: &Invitation, reminder: bool) {
        let notice = InvitationNotice {
            invitation_id: invitation.id.clone(),
            recipient: invitation.email.clone(),
            invite_url: self.invite_url(&invitation.token),
            role: invitation.role,
            target: EntityRef::new(invitation.invitation_type, invitation.target_id.clone()),
            reminder,
        };

        if let Err(e) = self.notifier.invitation_sent(&notice).await {
            tracing::warn!(invitation_id = %invitation.id, "Failed to deliver invitation notice: {:?}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Token invitations
    // ------------------------------------------------------------------------

    pub async fn create_invitation(
        &self,
        inviter_id: &str,
        input: CreateInvitation,
    ) -> AppResult<IssuedInvitation> {
        let kind = input.invitation_type;
        let target = self
            .target_in_workspace(&input.workspace_id, kind, &input.target_id)
            .await?;
        if !kind.allows_role(input.role) {
            return Err(AppError::InvalidInput(format!(
                "role {} is not valid for a {kind}",
                input.role
            )));
        }

        let email = normalize_email(&input.email);
        if email_domain(&email).is_none() {
            return Err(AppError::InvalidInput(format!("invalid email: {}", input.email)));
        }

        self.require_inviter(&target.entity_ref(), inviter_id, input.role)
            .await?;
        self.reject_existing_member(kind, &target.id, &email).await?;
        let expires_at = self.expiry(input.expires_in_hours)?;

        let mut tx = self.pool.begin().await?;
        Self::retire_overdue(&mut tx, kind, &target.id, &email).await?;
        let invitation = InvitationRepository::insert(
            &mut *tx,
            NewInvitation {
                workspace_id: input.workspace_id,
                email,
                token: generate_token(),
                link_token: None,
                invitation_type: kind,
                target_id: target.id,
                role: input.role,
                permission: input.permission,
                permissions: input.permissions,
                inviter_id: inviter_id.to_string(),
                method: InvitationMethod::Email,
                expires_at,
                max_uses: None,
                use_count: None,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            invitation_id = %invitation.id,
            target = %EntityRef::new(kind, invitation.target_id.clone()),
            role = %invitation.role,
            inviter_id,
            "Invitation created"
        );
        self.notify(&invitation, false).await;
        Ok(self.issued(invitation))
    }

    /// An overdue row the sweep has not reached yet still holds the pending
    /// slot for (target, email); expire it before inserting a new one.
    async fn retire_overdue(
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityType,
        target_id: &str,
        email: &str,
    ) -> AppResult<()> {
        let expired = InvitationRepository::expire_overdue_for(
            &mut **tx,
            kind,
            target_id,
            email,
            Utc::now().naive_utc(),
        )
        .await?;
        if expired > 0 {
            tracing::info!(target_id, email, "Expired overdue invitation before reissue");
        }
        Ok(())
    }

    pub async fn create_workspace_invitation(
        &self,
        inviter_id: &str,
        workspace_id: &str,
        request: InviteRequest,
    ) -> AppResult<IssuedInvitation> {
        let input = request.into_invitation(workspace_id, EntityType::Workspace, workspace_id);
        self.create_invitation(inviter_id, input).await
    }

    pub async fn create_project_invitation(
        &self,
        inviter_id: &str,
        workspace_id: &str,
        project_id: &str,
        request: InviteRequest,
    ) -> AppResult<IssuedInvitation> {
        let input = request.into_invitation(workspace_id, EntityType::Project, project_id);
        self.create_invitation(inviter_id, input).await
    }

    /// Terminal invitations cannot move again.
    fn ensure_open(invitation: &Invitation) -> AppResult<()> {
        if invitation.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "invitation is already {}",
                invitation.status.as_str()
            )));
        }
        Ok(())
    }

    /// Open and not past its expiry. An overdue invitation is flipped to
    /// `expired` on the way out.
    async fn ensure_redeemable(&self, invitation: &Invitation) -> AppResult<()> {
        Self::ensure_open(invitation)?;
        if invitation.is_expired_at(Utc::now().naive_utc()) {
            InvitationRepository::mark_closed(&self.pool, &invitation.id, InvitationStatus::Expired)
                .await?;
            tracing::info!(invitation_id = %invitation.id, "Invitation expired on use");
            return Err(AppError::Expired("invitation has expired".into()));
        }
        Ok(())
    }

    fn ensure_recipient(user: &User, invitation: &Invitation) -> AppResult<()> {
        if normalize_email(&user.email) != invitation.email {
            return Err(AppError::Forbidden(
                "invitation was sent to a different email address".into(),
            ));
        }
        Ok(())
    }

    pub async fn accept_by_token(&self, user: &User, token: &str) -> AppResult<AcceptedInvitation> {
        let invitation = InvitationRepository::find_by_token(&self.pool, token)
            .await?
            .ok_or(AppError::InvalidToken)?;
        self.accept(user, invitation).await
    }

    pub async fn accept_by_id(&self, user: &User, invitation_id: &str) -> AppResult<AcceptedInvitation> {
        let invitation = InvitationRepository::find_by_id(&self.pool, invitation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invitation {invitation_id} not found")))?;
        self.accept(user, invitation).await
    }

    /// pending -> accepted and the membership insert commit together; a
    /// failure of either leaves the invitation pending.
    async fn accept(&self, user: &User, invitation: Invitation) -> AppResult<AcceptedInvitation> {
        Self::ensure_recipient(user, &invitation)?;
        self.ensure_redeemable(&invitation).await?;

        let mut tx = self.pool.begin().await?;
        let accepted = InvitationRepository::mark_accepted(&mut *tx, &invitation.id, &user.id)
            .await?
            .ok_or_else(|| AppError::Conflict("invitation is no longer pending".into()))?;
        let membership = MembershipRepository::insert(
            &mut *tx,
            accepted.invitation_type,
            &accepted.target_id,
            &user.id,
            accepted.role,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            invitation_id = %accepted.id,
            user_id = %user.id,
            role = %accepted.role,
            "Invitation accepted"
        );
        Ok(AcceptedInvitation {
            permissions: accepted.effective_permissions(),
            invitation: accepted,
            membership,
        })
    }

    pub async fn decline_by_id(&self, user: &User, invitation_id: &str) -> AppResult<Invitation> {
        let invitation = self.find(invitation_id).await?;
        Self::ensure_open(&invitation)?;
        Self::ensure_recipient(user, &invitation)?;

        let declined = InvitationRepository::mark_declined(&self.pool, &invitation.id, &user.id)
            .await?
            .ok_or_else(|| AppError::Conflict("invitation is no longer pending".into()))?;
        tracing::info!(invitation_id, user_id = %user.id, "Invitation declined");
        Ok(declined)
    }

    async fn find(&self, invitation_id: &str) -> AppResult<Invitation> {
        InvitationRepository::find_by_id(&self.pool, invitation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invitation {invitation_id} not found")))
    }

    async fn find_managed(&self, actor_id: &str, invitation_id: &str) -> AppResult<Invitation> {
        let invitation = self.find(invitation_id).await?;
        let target = EntityRef::new(invitation.invitation_type, invitation.target_id.clone());
        self.access.require_manager(&target, actor_id).await?;
        Ok(invitation)
    }

    /// New token, one more reminder, and a fresh expiry of the same length
    /// as the original. `created_at` is left alone.
    pub async fn resend(&self, actor_id: &str, invitation_id: &str) -> AppResult<IssuedInvitation> {
        let invitation = self.find_managed(actor_id, invitation_id).await?;
        Self::ensure_open(&invitation)?;

        let now = Utc::now().naive_utc();
        let expires_at = invitation
            .expires_at
            .map(|at| now + (at - invitation.created_at));
        let resent = InvitationRepository::rotate_token(
            &self.pool,
            &invitation.id,
            &generate_token(),
            expires_at,
            true,
        )
        .await?
        .ok_or_else(|| AppError::Conflict("invitation is no longer pending".into()))?;

        tracing::info!(invitation_id, reminder_count = resent.reminder_count, "Invitation resent");
        self.notify(&resent, true).await;
        Ok(self.issued(resent))
    }

    /// New token only; the previous one stops working immediately.
    pub async fn regenerate_token(&self, actor_id: &str, invitation_id: &str) -> AppResult<IssuedInvitation> {
        let invitation = self.find_managed(actor_id, invitation_id).await?;
        Self::ensure_open(&invitation)?;

        let rotated = InvitationRepository::rotate_token(
            &self.pool,
            &invitation.id,
            &generate_token(),
            invitation.expires_at,
            false,
        )
        .await?
        .ok_or_else(|| AppError::Conflict("invitation is no longer pending".into()))?;

        tracing::info!(invitation_id, "Invitation token regenerated");
        Ok(self.issued(rotated))
    }

    /// The inviter or any manager of the target may cancel.
    pub async fn cancel(&self, actor_id: &str, invitation_id: &str) -> AppResult<Invitation> {
        let invitation = self.find(invitation_id).await?;
        if invitation.inviter_id != actor_id {
            let target = EntityRef::new(invitation.invitation_type, invitation.target_id.clone());
            self.access.require_manager(&target, actor_id).await?;
        }
        self.close(&invitation, InvitationStatus::Cancelled).await
    }

    pub async fn revoke(&self, actor_id: &str, invitation_id: &str) -> AppResult<Invitation> {
        let invitation = self.find_managed(actor_id, invitation_id).await?;
        self.close(&invitation, InvitationStatus::Revoked).await
    }

    async fn close(&self, invitation: &Invitation, status: InvitationStatus) -> AppResult<Invitation> {
        Self::ensure_open(invitation)?;
        let closed = InvitationRepository::mark_closed(&self.pool, &invitation.id, status)
            .await?
            .ok_or_else(|| AppError::Conflict("invitation is no longer pending".into()))?;
        tracing::info!(invitation_id = %invitation.id, status = status.as_str(), "Invitation closed");
        Ok(closed)
    }

    pub async fn list_for_target(
        &self,
        actor_id: &str,
        kind: EntityType,
        target_id: &str,
    ) -> AppResult<Vec<Invitation>> {
        self.access
            .require_manager(&EntityRef::new(kind, target_id), actor_id)
            .await?;
        InvitationRepository::list_for_target(&self.pool, kind, target_id).await
    }

    /// Pending invitations addressed to the user's email.
    pub async fn list_pending_for_user(&self, user: &User) -> AppResult<Vec<Invitation>> {
        InvitationRepository::list_pending_for_email(&self.pool, &normalize_email(&user.email)).await
    }

    /// Flip every overdue pending invitation to `expired`.
    pub async fn expire_overdue(&self) -> AppResult<u64> {
        let expired = InvitationRepository::expire_overdue(&self.pool, Utc::now().naive_utc()).await?;
        if expired > 0 {
            tracing::info!(expired, "Expired overdue invitations");
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------------
    // Shareable links
    // ------------------------------------------------------------------------

    /// Create the link for a target, deactivating whichever link was active.
    pub async fn create_link_settings(
        &self,
        actor_id: &str,
        mut input: CreateLinkSettings,
    ) -> AppResult<InvitationLinkSettings> {
        let kind = input.link_type;
        let target = self
            .target_in_workspace(&input.workspace_id, kind, &input.target_id)
            .await?;
        if !kind.allows_role(input.role) {
            return Err(AppError::InvalidInput(format!(
                "role {} is not valid for a {kind}",
                input.role
            )));
        }
        if input.max_uses.is_some_and(|max| max < 1) {
            return Err(AppError::InvalidInput("max_uses must be at least 1".into()));
        }
        if input
            .expires_at
            .is_some_and(|at| at <= Utc::now().naive_utc())
        {
            return Err(AppError::InvalidInput("expires_at must be in the future".into()));
        }
        normalize_domains(&mut input.allowed_domains);
        normalize_domains(&mut input.blocked_domains);

        self.require_inviter(&target.entity_ref(), actor_id, input.role)
            .await?;

        let mut tx = self.pool.begin().await?;
        let superseded =
            LinkSettingsRepository::deactivate_for_target(&mut *tx, &input.workspace_id, kind, &target.id)
                .await?;
        let settings =
            LinkSettingsRepository::insert(&mut *tx, &input, &generate_token(), actor_id).await?;
        tx.commit().await?;

        tracing::info!(
            link_id = %settings.id,
            target = %target.entity_ref(),
            superseded,
            max_uses = ?settings.max_uses,
            "Invitation link created"
        );
        Ok(settings)
    }

    pub async fn get_active_link(
        &self,
        actor_id: &str,
        workspace_id: &str,
        kind: EntityType,
        target_id: &str,
    ) -> AppResult<Option<InvitationLinkSettings>> {
        self.access
            .require_manager(&EntityRef::new(kind, target_id), actor_id)
            .await?;
        LinkSettingsRepository::find_active_for_target(&self.pool, workspace_id, kind, target_id).await
    }

    pub async fn deactivate_link(&self, actor_id: &str, link_id: &str) -> AppResult<InvitationLinkSettings> {
        let settings = LinkSettingsRepository::find_by_id(&self.pool, link_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invitation link {link_id} not found")))?;
        self.access
            .require_manager(
                &EntityRef::new(settings.link_type, settings.target_id.clone()),
                actor_id,
            )
            .await?;

        let settings = LinkSettingsRepository::deactivate(&self.pool, link_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invitation link {link_id} not found")))?;
        tracing::info!(link_id, "Invitation link deactivated");
        Ok(settings)
    }

    /// `UseInvitationLink`: claim one use of the link and mint a pending
    /// invitation for `email`, or an access request when the link requires
    /// approval. The claim and the new row commit together.
    pub async fn use_invitation_link(&self, link_token: &str, email: &str) -> AppResult<LinkRedemption> {
        let settings = LinkSettingsRepository::find_by_token(&self.pool, link_token)
            .await?
            .ok_or(AppError::InvalidToken)?;

        let email = normalize_email(email);
        if email_domain(&email).is_none() {
            return Err(AppError::InvalidInput(format!("invalid email: {email}")));
        }

        match settings.state_at(Utc::now().naive_utc()) {
            LinkState::Valid => {}
            LinkState::Inactive => return Err(AppError::InvalidToken),
            LinkState::Expired => {
                return Err(AppError::Expired("invitation link has expired".into()))
            }
            LinkState::Exhausted => return Err(link_exhausted()),
        }
        if !settings.admits_email(&email) {
            return Err(AppError::Forbidden(
                "email domain is not accepted by this link".into(),
            ));
        }
        self.reject_existing_member(settings.link_type, &settings.target_id, &email)
            .await?;

        if settings.requires_approval {
            return self.request_through_link(&settings, &email).await;
        }

        let mut tx = self.pool.begin().await?;
        let claimed = Self::claim_use(&mut tx, &settings).await?;
        Self::retire_overdue(&mut tx, settings.link_type, &settings.target_id, &email).await?;
        let invitation = InvitationRepository::insert(
            &mut *tx,
            NewInvitation {
                workspace_id: settings.workspace_id.clone(),
                email,
                token: generate_token(),
                link_token: Some(settings.link_token.clone()),
                invitation_type: settings.link_type,
                target_id: settings.target_id.clone(),
                role: settings.role,
                permission: settings.permission,
                permissions: None,
                inviter_id: settings.created_by.clone(),
                method: InvitationMethod::Link,
                expires_at: self.expiry(None)?,
                max_uses: claimed.max_uses,
                use_count: Some(claimed.use_count),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            link_id = %settings.id,
            invitation_id = %invitation.id,
            use_count = claimed.use_count,
            "Invitation link redeemed"
        );
        self.notify(&invitation, false).await;
        Ok(LinkRedemption::Invitation(invitation))
    }

    /// One guarded use of the link. A refused claim is reported as expiry when
    /// the link ran out of time since it was read, otherwise as exhaustion.
    async fn claim_use(
        tx: &mut Transaction<'_, Sqlite>,
        settings: &InvitationLinkSettings,
    ) -> AppResult<InvitationLinkSettings> {
        let now = Utc::now().naive_utc();
        match LinkSettingsRepository::try_consume(&mut **tx, &settings.id, now).await? {
            Some(claimed) => Ok(claimed),
            None if settings.is_expired_at(now) => {
                Err(AppError::Expired("invitation link has expired".into()))
            }
            None => Err(link_exhausted()),
        }
    }

    async fn request_through_link(
        &self,
        settings: &InvitationLinkSettings,
        email: &str,
    ) -> AppResult<LinkRedemption> {
        let requester = UserRepository::find_by_email(&self.pool, email)
            .await?
            .ok_or_else(|| {
                AppError::InvalidInput("this link requires approval; sign up first".into())
            })?;

        let mut tx = self.pool.begin().await?;
        let claimed = Self::claim_use(&mut tx, settings).await?;
        let request = AccessRequestRepository::insert(
            &mut *tx,
            &settings.workspace_id,
            &requester.id,
            email,
            settings.link_type,
            &settings.target_id,
            settings.role,
            None,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            link_id = %settings.id,
            request_id = %request.id,
            use_count = claimed.use_count,
            "Invitation link redeemed for approval"
        );
        Ok(LinkRedemption::AccessRequest(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccessOrigin, Permission};
    use crate::services::notifier::RecordingNotifier;
    use crate::services::test_support::*;

    struct Harness {
        pool: SqlitePool,
        access: AccessResolver,
        notifier: Arc<RecordingNotifier>,
        invitations: InvitationService,
        owner: User,
        ws: EntityRecord,
    }

    async fn harness_with(notifier: RecordingNotifier) -> Harness {
        let (pool, access) = setup().await;
        harness_on(pool, access, notifier).await
    }

    async fn harness_on(pool: SqlitePool, access: AccessResolver, notifier: RecordingNotifier) -> Harness {
        let owner = user(&pool, "owner@example.com").await;
        let ws = workspace(&pool, &owner).await;
        let notifier = Arc::new(notifier);
        let invitations = InvitationService::new(
            pool.clone(),
            access.clone(),
            notifier.clone(),
            InvitationSettings {
                app_url: "https://app.example.com/".into(),
                default_ttl_hours: Some(72),
            },
        );
        Harness {
            pool,
            access,
            notifier,
            invitations,
            owner,
            ws,
        }
    }

    async fn harness() -> Harness {
        harness_with(RecordingNotifier::default()).await
    }

    fn invite(email: &str, role: Role) -> InviteRequest {
        InviteRequest {
            email: email.into(),
            role,
            permission: Permission::Edit,
            permissions: None,
            expires_in_hours: None,
        }
    }

    fn link(h: &Harness, max_uses: Option<i64>) -> CreateLinkSettings {
        CreateLinkSettings {
            workspace_id: h.ws.id.clone(),
            link_type: EntityType::Workspace,
            target_id: h.ws.id.clone(),
            role: Role::Member,
            permission: Permission::Comment,
            requires_approval: false,
            allowed_domains: vec![],
            blocked_domains: vec![],
            max_uses,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn invite_accept_and_accept_again() {
        let h = harness().await;
        let ada = user(&h.pool, "ada@example.com").await;

        let issued = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("Ada@Example.com", Role::Member))
            .await
            .unwrap();
        assert_eq!(issued.invitation.email, "ada@example.com");
        assert_eq!(issued.invitation.status, InvitationStatus::Pending);
        assert!(issued.invitation.expires_at.is_some());
        assert_eq!(
            issued.invite_url,
            format!("https://app.example.com/invite/{}", issued.invitation.token)
        );

        let sent = h.notifier.sent.lock().await.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ada@example.com");
        assert_eq!(sent[0].invite_url, issued.invite_url);

        let token = issued.invitation.token.clone();
        let accepted = h.invitations.accept_by_token(&ada, &token).await.unwrap();
        assert_eq!(accepted.invitation.status, InvitationStatus::Accepted);
        assert_eq!(accepted.invitation.invitee_user_id.as_deref(), Some(ada.id.as_str()));
        assert!(accepted.invitation.accepted_at.is_some());
        assert_eq!(accepted.membership.role, Role::Member);
        assert!(accepted.permissions.can_edit);

        let level = h
            .access
            .get_access_level(&h.ws.entity_ref(), &ada.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.origin, AccessOrigin::Direct);

        // Second acceptance: rejected, nothing new written.
        assert!(matches!(
            h.invitations.accept_by_token(&ada, &token).await,
            Err(AppError::Conflict(_))
        ));
        let rows = MembershipRepository::list_for_entity(&h.pool, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap();
        assert_eq!(rows.iter().filter(|m| m.user_id == ada.id).count(), 1);
    }

    /// Spawn `n` tasks on the runtime and collect their results in order.
    async fn race<T, F, Fut>(n: usize, f: F) -> Vec<AppResult<T>>
    where
        T: Send + 'static,
        F: Fn(usize) -> Fut,
        Fut: std::future::Future<Output = AppResult<T>> + Send + 'static,
    {
        futures::future::join_all((0..n).map(|i| tokio::spawn(f(i))))
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acceptance_creates_one_membership() {
        let (pool, access, _dir) = shared_setup().await;
        let h = harness_on(pool, access, RecordingNotifier::default()).await;
        let ada = user(&h.pool, "ada@example.com").await;
        let issued = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Guest))
            .await
            .unwrap();

        let token = issued.invitation.token.clone();
        let results = race(8, |_| {
            let invitations = h.invitations.clone();
            let ada = ada.clone();
            let token = token.clone();
            async move { invitations.accept_by_token(&ada, &token).await }
        })
        .await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(AppError::Conflict(_)))));
        let rows = MembershipRepository::list_for_entity(&h.pool, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn acceptance_checks_token_email_and_expiry() {
        let h = harness().await;
        let ada = user(&h.pool, "ada@example.com").await;
        let eve = user(&h.pool, "eve@example.com").await;

        assert!(matches!(
            h.invitations.accept_by_token(&ada, "no-such-token").await,
            Err(AppError::InvalidToken)
        ));

        let issued = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap();
        assert!(matches!(
            h.invitations.accept_by_token(&eve, &issued.invitation.token).await,
            Err(AppError::Forbidden(_))
        ));
        let still = InvitationRepository::find_by_id(&h.pool, &issued.invitation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still.status, InvitationStatus::Pending);

        // An invitation already past its expiry.
        let overdue = InvitationRepository::insert(
            &h.pool,
            NewInvitation {
                workspace_id: h.ws.id.clone(),
                email: "eve@example.com".into(),
                token: generate_token(),
                link_token: None,
                invitation_type: EntityType::Workspace,
                target_id: h.ws.id.clone(),
                role: Role::Member,
                permission: Permission::Edit,
                permissions: None,
                inviter_id: h.owner.id.clone(),
                method: InvitationMethod::Email,
                expires_at: Some(Utc::now().naive_utc() - Duration::hours(1)),
                max_uses: None,
                use_count: None,
            },
        )
        .await
        .unwrap();
        // Someone else's overdue invitation is refused without touching it.
        assert!(matches!(
            h.invitations.accept_by_id(&ada, &overdue.id).await,
            Err(AppError::Forbidden(_))
        ));
        let untouched = InvitationRepository::find_by_id(&h.pool, &overdue.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, InvitationStatus::Pending);

        assert!(matches!(
            h.invitations.accept_by_id(&eve, &overdue.id).await,
            Err(AppError::Expired(_))
        ));
        let overdue = InvitationRepository::find_by_id(&h.pool, &overdue.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(overdue.status, InvitationStatus::Expired);
        assert!(!h
            .access
            .has_effective_access(&h.ws.entity_ref(), &eve.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn creation_rules() {
        let h = harness().await;
        let member = user(&h.pool, "member@example.com").await;
        grant(&h.pool, &h.ws, &member, Role::Member).await;
        let s = space(&h.pool, &h.ws).await;
        let p = project(&h.pool, &s, None).await;
        let t = task(&h.pool, &p).await;

        // project leads are a thing, workspace leads are not
        h.invitations
            .create_project_invitation(&h.owner.id, &h.ws.id, &p.id, invite("lead@example.com", Role::Lead))
            .await
            .unwrap();
        assert!(matches!(
            h.invitations
                .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("x@example.com", Role::Lead))
                .await,
            Err(AppError::InvalidInput(_))
        ));

        // one pending invitation per (target, email)
        assert!(matches!(
            h.invitations
                .create_project_invitation(&h.owner.id, &h.ws.id, &p.id, invite("lead@example.com", Role::Member))
                .await,
            Err(AppError::Conflict(_))
        ));

        // already a member
        assert!(matches!(
            h.invitations
                .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("member@example.com", Role::Guest))
                .await,
            Err(AppError::Conflict(_))
        ));

        // members cannot invite
        assert!(matches!(
            h.invitations
                .create_workspace_invitation(&member.id, &h.ws.id, invite("y@example.com", Role::Guest))
                .await,
            Err(AppError::Forbidden(_))
        ));

        // tasks carry no memberships
        let input = invite("z@example.com", Role::Member).into_invitation(&h.ws.id, EntityType::Task, &t.id);
        assert!(matches!(
            h.invitations.create_invitation(&h.owner.id, input).await,
            Err(AppError::InvalidEntityType(_))
        ));

        // the target must live in the named workspace
        let other_owner = user(&h.pool, "other@example.com").await;
        let other_ws = workspace(&h.pool, &other_owner).await;
        assert!(matches!(
            h.invitations
                .create_project_invitation(&h.owner.id, &other_ws.id, &p.id, invite("q@example.com", Role::Member))
                .await,
            Err(AppError::InvalidInput(_))
        ));

        assert!(matches!(
            h.invitations
                .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("not-an-email", Role::Member))
                .await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn resend_and_regenerate_rotate_the_token() {
        let h = harness().await;
        let issued = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap();
        let original = issued.invitation;

        let resent = h.invitations.resend(&h.owner.id, &original.id).await.unwrap();
        assert_ne!(resent.invitation.token, original.token);
        assert_eq!(resent.invitation.reminder_count, 1);
        assert_eq!(resent.invitation.created_at, original.created_at);
        assert!(resent.invitation.last_sent_at.is_some());
        assert!(resent.invitation.expires_at >= original.expires_at);
        assert!(matches!(
            InvitationRepository::find_by_token(&h.pool, &original.token).await,
            Ok(None)
        ));

        let sent = h.notifier.sent.lock().await.clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].reminder);

        let regenerated = h
            .invitations
            .regenerate_token(&h.owner.id, &original.id)
            .await
            .unwrap();
        assert_ne!(regenerated.invitation.token, resent.invitation.token);
        assert_eq!(regenerated.invitation.reminder_count, 1);
        assert_eq!(regenerated.invitation.expires_at, resent.invitation.expires_at);
        assert_eq!(h.notifier.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_revoke_and_decline_are_terminal() {
        let h = harness().await;
        let ada = user(&h.pool, "ada@example.com").await;

        let first = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap()
            .invitation;
        let cancelled = h.invitations.cancel(&h.owner.id, &first.id).await.unwrap();
        assert_eq!(cancelled.status, InvitationStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(matches!(
            h.invitations.cancel(&h.owner.id, &first.id).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            h.invitations.accept_by_token(&ada, &first.token).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            h.invitations.resend(&h.owner.id, &first.id).await,
            Err(AppError::Conflict(_))
        ));

        // A cancelled invitation frees the slot for a new one.
        let second = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap()
            .invitation;
        let revoked = h.invitations.revoke(&h.owner.id, &second.id).await.unwrap();
        assert_eq!(revoked.status, InvitationStatus::Revoked);

        let third = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap()
            .invitation;
        assert_eq!(h.invitations.list_pending_for_user(&ada).await.unwrap().len(), 1);

        let declined = h.invitations.decline_by_id(&ada, &third.id).await.unwrap();
        assert_eq!(declined.status, InvitationStatus::Declined);
        assert!(declined.declined_at.is_some());
        assert!(matches!(
            h.invitations.decline_by_id(&ada, &third.id).await,
            Err(AppError::Conflict(_))
        ));
        assert!(h.invitations.list_pending_for_user(&ada).await.unwrap().is_empty());

        let all = h
            .invitations
            .list_for_target(&h.owner.id, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn overdue_sweep() {
        let h = harness().await;
        let fresh = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("fresh@example.com", Role::Member))
            .await
            .unwrap()
            .invitation;
        sqlx::query("UPDATE invitations SET expires_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc() - Duration::minutes(5))
            .bind(&fresh.id)
            .execute(&h.pool)
            .await
            .unwrap();
        h.invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("later@example.com", Role::Member))
            .await
            .unwrap();

        assert_eq!(h.invitations.expire_overdue().await.unwrap(), 1);
        assert_eq!(h.invitations.expire_overdue().await.unwrap(), 0);
        let swept = InvitationRepository::find_by_id(&h.pool, &fresh.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, InvitationStatus::Expired);
    }

    async fn backdate(pool: &SqlitePool, invitation_id: &str) {
        sqlx::query("UPDATE invitations SET expires_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc() - Duration::hours(1))
            .bind(invitation_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reinvite_replaces_an_unswept_overdue_invitation() {
        let h = harness().await;
        let first = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap()
            .invitation;

        // Still pending and in date: the slot is taken.
        assert!(matches!(
            h.invitations
                .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
                .await,
            Err(AppError::Conflict(_))
        ));

        backdate(&h.pool, &first.id).await;
        let second = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Guest))
            .await
            .unwrap()
            .invitation;
        assert_eq!(second.status, InvitationStatus::Pending);
        let first = InvitationRepository::find_by_id(&h.pool, &first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, InvitationStatus::Expired);

        // Link redemption frees the slot the same way.
        backdate(&h.pool, &second.id).await;
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, Some(1)))
            .await
            .unwrap();
        let redeemed = h
            .invitations
            .use_invitation_link(&settings.link_token, "ada@example.com")
            .await
            .unwrap();
        assert!(matches!(redeemed, LinkRedemption::Invitation(ref i) if i.status == InvitationStatus::Pending));
        let pending: Vec<_> = InvitationRepository::list_for_target(&h.pool, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.status == InvitationStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn link_claim_rechecks_expiry() {
        let h = harness().await;
        let mut input = link(&h, Some(5));
        input.expires_at = Some(Utc::now().naive_utc() + Duration::hours(1));
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, input)
            .await
            .unwrap();

        let later = Utc::now().naive_utc() + Duration::hours(2);
        assert!(LinkSettingsRepository::try_consume(&h.pool, &settings.id, later)
            .await
            .unwrap()
            .is_none());
        let claimed = LinkSettingsRepository::try_consume(&h.pool, &settings.id, Utc::now().naive_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.use_count, 1);
    }

    #[tokio::test]
    async fn notifier_failure_keeps_the_invitation() {
        let h = harness_with(RecordingNotifier {
            fail: true,
            ..Default::default()
        })
        .await;

        let issued = h
            .invitations
            .create_workspace_invitation(&h.owner.id, &h.ws.id, invite("ada@example.com", Role::Member))
            .await
            .unwrap();
        assert_eq!(h.notifier.sent.lock().await.len(), 1);
        assert!(InvitationRepository::find_by_id(&h.pool, &issued.invitation.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn link_quota_holds_under_concurrency() {
        let (pool, access, _dir) = shared_setup().await;
        let h = harness_on(pool, access, RecordingNotifier::default()).await;
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, Some(3)))
            .await
            .unwrap();

        let results = race(12, |i| {
            let invitations = h.invitations.clone();
            let token = settings.link_token.clone();
            async move {
                invitations
                    .use_invitation_link(&token, &format!("user{i}@example.com"))
                    .await
            }
        })
        .await;

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::Conflict(_))))
            .count();
        assert_eq!((ok, conflicts), (3, 9));

        let after = LinkSettingsRepository::find_by_id(&h.pool, &settings.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.use_count, 3);

        let minted = InvitationRepository::list_for_target(&h.pool, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap();
        assert_eq!(minted.len(), 3);
        assert!(minted.iter().all(|i| i.method == InvitationMethod::Link
            && i.link_token.as_deref() == Some(settings.link_token.as_str())
            && i.max_uses == Some(3)));
        let mut slots: Vec<i64> = minted.iter().filter_map(|i| i.use_count).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_use_link_three_redeemers() {
        let (pool, access, _dir) = shared_setup().await;
        let h = harness_on(pool, access, RecordingNotifier::default()).await;
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, Some(2)))
            .await
            .unwrap();

        let emails = ["a@example.com", "b@example.com", "c@example.com"];
        let results = race(emails.len(), |i| {
            let invitations = h.invitations.clone();
            let token = settings.link_token.clone();
            let email = emails[i];
            async move { invitations.use_invitation_link(&token, email).await }
        })
        .await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AppError::Conflict(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn link_redemption_then_acceptance() {
        let h = harness().await;
        let ada = user(&h.pool, "ada@example.com").await;
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, None))
            .await
            .unwrap();

        let LinkRedemption::Invitation(invitation) = h
            .invitations
            .use_invitation_link(&settings.link_token, "ADA@example.com")
            .await
            .unwrap()
        else {
            panic!("expected an invitation");
        };
        assert_eq!(invitation.email, "ada@example.com");
        assert_eq!(invitation.inviter_id, h.owner.id);
        assert_eq!(h.notifier.sent.lock().await.len(), 1);

        let accepted = h
            .invitations
            .accept_by_token(&ada, &invitation.token)
            .await
            .unwrap();
        assert_eq!(accepted.membership.role, Role::Member);
        assert!(accepted.permissions.can_comment && !accepted.permissions.can_edit);

        // Members cannot burn another use.
        assert!(matches!(
            h.invitations
                .use_invitation_link(&settings.link_token, "ada@example.com")
                .await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn link_settings_lifecycle() {
        let h = harness().await;

        let mut bad = link(&h, Some(0));
        assert!(matches!(
            h.invitations.create_link_settings(&h.owner.id, bad.clone()).await,
            Err(AppError::InvalidInput(_))
        ));
        bad.max_uses = None;
        bad.expires_at = Some(Utc::now().naive_utc() - Duration::minutes(1));
        assert!(matches!(
            h.invitations.create_link_settings(&h.owner.id, bad).await,
            Err(AppError::InvalidInput(_))
        ));

        let mut restricted = link(&h, None);
        restricted.allowed_domains = vec![" @Example.com ".into()];
        restricted.blocked_domains = vec!["spam.example.com".into()];
        let first = h
            .invitations
            .create_link_settings(&h.owner.id, restricted)
            .await
            .unwrap();
        assert_eq!(first.allowed_domains, vec!["example.com".to_string()]);
        assert!(matches!(
            h.invitations
                .use_invitation_link(&first.link_token, "eve@evil.io")
                .await,
            Err(AppError::Forbidden(_))
        ));

        // A new link supersedes the old one.
        let second = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, None))
            .await
            .unwrap();
        assert!(matches!(
            h.invitations
                .use_invitation_link(&first.link_token, "ada@example.com")
                .await,
            Err(AppError::InvalidToken)
        ));
        let active = h
            .invitations
            .get_active_link(&h.owner.id, &h.ws.id, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);

        h.invitations.deactivate_link(&h.owner.id, &second.id).await.unwrap();
        assert!(h
            .invitations
            .get_active_link(&h.owner.id, &h.ws.id, EntityType::Workspace, &h.ws.id)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            h.invitations.use_invitation_link("unknown", "ada@example.com").await,
            Err(AppError::InvalidToken)
        ));

        // Expired links report Expired.
        let third = h
            .invitations
            .create_link_settings(&h.owner.id, link(&h, None))
            .await
            .unwrap();
        sqlx::query("UPDATE invitation_link_settings SET expires_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc() - Duration::minutes(1))
            .bind(&third.id)
            .execute(&h.pool)
            .await
            .unwrap();
        assert!(matches!(
            h.invitations
                .use_invitation_link(&third.link_token, "ada@example.com")
                .await,
            Err(AppError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn approval_links_open_access_requests() {
        let h = harness().await;
        let ada = user(&h.pool, "ada@example.com").await;
        let s = space(&h.pool, &h.ws).await;

        let mut gated = link(&h, Some(5));
        gated.link_type = EntityType::Space;
        gated.target_id = s.id.clone();
        gated.role = Role::Guest;
        gated.requires_approval = true;
        let settings = h
            .invitations
            .create_link_settings(&h.owner.id, gated)
            .await
            .unwrap();

        let LinkRedemption::AccessRequest(request) = h
            .invitations
            .use_invitation_link(&settings.link_token, "ada@example.com")
            .await
            .unwrap()
        else {
            panic!("expected an access request");
        };
        assert_eq!(request.requester_id, ada.id);
        assert_eq!(request.role, Role::Guest);
        assert_eq!(request.request_type, EntityType::Space);

        assert!(matches!(
            h.invitations
                .use_invitation_link(&settings.link_token, "nobody@example.com")
                .await,
            Err(AppError::InvalidInput(_))
        ));
        // A second pending request from the same user is a conflict and
        // does not consume a use.
        assert!(matches!(
            h.invitations
                .use_invitation_link(&settings.link_token, "ada@example.com")
                .await,
            Err(AppError::Conflict(_))
        ));
        let after = LinkSettingsRepository::find_by_id(&h.pool, &settings.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.use_count, 1);
    }
}
