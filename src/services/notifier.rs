use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::{EntityRef, Role};
use crate::error::AppResult;

/// Payload handed to the notification collaborator after an invitation is
/// created or resent.
#[derive(Debug, Clone, Serialize)]
pub struct InvitationNotice {
    pub invitation_id: String,
    pub recipient: String,
    pub invite_url: String,
    pub role: Role,
    pub target: EntityRef,
    /// `true` for resends.
    pub reminder: bool,
}

#[async_trait]
pub trait InvitationNotifier: Send + Sync + 'static {
    async fn invitation_sent(&self, notice: &InvitationNotice) -> AppResult<()>;
}

/// Writes notices to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl InvitationNotifier for LogNotifier {
    async fn invitation_sent(&self, notice: &InvitationNotice) -> AppResult<()> {
        tracing::info!(
            invitation_id = %notice.invitation_id,
            recipient = %notice.recipient,
            target = %notice.target,
            role = %notice.role,
            reminder = notice.reminder,
            "Invitation notice (no delivery configured)"
        );
        Ok(())
    }
}

/// POSTs each notice as JSON to a delivery service.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl InvitationNotifier for WebhookNotifier {
    async fn invitation_sent(&self, notice: &InvitationNotice) -> AppResult<()> {
        self.client
            .post(&self.url)
            .json(notice)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(invitation_id = %notice.invitation_id, "Invitation notice delivered");
        Ok(())
    }
}

/// Collects notices in memory; optionally fails every delivery.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: tokio::sync::Mutex<Vec<InvitationNotice>>,
    pub fail: bool,
}

#[cfg(test)]
#[async_trait]
impl InvitationNotifier for RecordingNotifier {
    async fn invitation_sent(&self, notice: &InvitationNotice) -> AppResult<()> {
        self.sent.lock().await.push(notice.clone());
        if self.fail {
            return Err(crate::error::AppError::Internal(anyhow::anyhow!(
                "delivery refused"
            )));
        }
        Ok(())
    }
}
