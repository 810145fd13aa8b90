//! Inbound event ingestion.
//!
//! Provider webhooks, the tracking endpoints (/visit, /opens) and the
//! notification-center actions all funnel into the engagement recorder.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use mailtide_database::{
    EngagementRecorder, ListsRepository, WebhookDeliveriesRepository, WorkspaceRegistry,
};
use mailtide_models::{EmailEvent, EmailEventKind, MembershipStatus};
use mailtide_providers::webhooks;
use mailtide_utils::crypto::verify_email_hmac;
use mailtide_utils::validation::normalize_email;
use mailtide_utils::MailtideError;

pub struct IngestService {
    registry: Arc<WorkspaceRegistry>,
}

impl IngestService {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self { registry }
    }

    async fn recorder(&self, workspace_id: &str) -> Result<(EngagementRecorder, sqlx::PgPool)> {
        let workspace = self.registry.load_workspace(workspace_id).await?;
        let pool = self.registry.workspace_pool(workspace_id).await?;
        let secret_key = workspace
            .settings
            .secret_key
            .clone()
            .context("workspace secret key not decrypted")?;
        Ok((EngagementRecorder::new(pool.clone(), secret_key), pool))
    }

    /// Normalize and record a provider webhook payload. Returns how many
    /// events were applied.
    pub async fn handle_webhook(
        &self,
        workspace_id: &str,
        integration_id: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let workspace = self.registry.load_workspace(workspace_id).await?;
        let integration = workspace
            .email_integration(integration_id)
            .and_then(|i| i.email.as_ref())
            .ok_or_else(|| MailtideError::not_found("integration"))?;

        let (recorder, pool) = self.recorder(workspace_id).await?;
        let events = webhooks::normalize(integration.provider, &payload);

        let mut applied = 0;
        for event in &events {
            if recorder.apply(&event.clone().into_email_event()).await? {
                applied += 1;
            }
        }

        WebhookDeliveriesRepository::new(pool)
            .record(integration_id, &integration.provider.to_string(), &payload, applied as i32)
            .await?;

        tracing::info!(
            workspace_id,
            integration_id,
            normalized = events.len(),
            applied,
            "webhook processed"
        );
        Ok(applied)
    }

    /// A /visit hit: record the click (which implies an open) and hand the
    /// caller the redirect target.
    pub async fn handle_visit(
        &self,
        workspace_id: &str,
        message_id: &str,
        url: &str,
    ) -> Result<String> {
        let (recorder, _) = self.recorder(workspace_id).await?;

        let event = EmailEvent {
            message_id: Some(message_id.to_string()),
            recipient: None,
            kind: EmailEventKind::Clicked,
            time: Utc::now(),
            detail: Some(url.to_string()),
            is_hard_bounce: None,
            email_hmac: None,
            list_ids: Vec::new(),
        };
        recorder.apply(&event).await?;

        Ok(url.to_string())
    }

    /// An /opens pixel hit.
    pub async fn handle_open(&self, workspace_id: &str, message_id: &str) -> Result<()> {
        let (recorder, _) = self.recorder(workspace_id).await?;
        recorder
            .apply(&EmailEvent::new(
                EmailEventKind::Opened,
                message_id,
                Utc::now(),
            ))
            .await?;
        Ok(())
    }

    /// Signed one-click unsubscribe from the notification center. The HMAC
    /// is verified by the recorder; mismatches drop the event.
    pub async fn handle_unsubscribe(
        &self,
        workspace_id: &str,
        email: &str,
        email_hmac: &str,
        list_id: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let (recorder, _) = self.recorder(workspace_id).await?;

        let event = EmailEvent {
            message_id: message_id.map(str::to_string),
            recipient: Some(normalize_email(email)),
            kind: EmailEventKind::Unsubscribed,
            time: Utc::now(),
            detail: None,
            is_hard_bounce: None,
            email_hmac: Some(email_hmac.to_string()),
            list_ids: list_id.map(str::to_string).into_iter().collect(),
        };
        recorder.apply(&event).await
    }

    /// Signed double-opt-in confirmation: pending membership goes active.
    pub async fn handle_confirm(
        &self,
        workspace_id: &str,
        email: &str,
        email_hmac: &str,
        list_id: &str,
    ) -> Result<bool> {
        let workspace = self.registry.load_workspace(workspace_id).await?;
        let secret_key = workspace
            .settings
            .secret_key
            .as_deref()
            .context("workspace secret key not decrypted")?;

        let email = normalize_email(email);
        if !verify_email_hmac(&email, secret_key, email_hmac) {
            tracing::warn!(workspace_id, "confirmation dropped: HMAC mismatch");
            return Ok(false);
        }

        let pool = self.registry.workspace_pool(workspace_id).await?;
        let lists = ListsRepository::new(pool);

        match lists.membership(&email, list_id).await? {
            Some(membership) if membership.status == MembershipStatus::Pending => {
                lists
                    .update_status(&email, list_id, MembershipStatus::Active)
                    .await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }
}

/// 1×1 transparent GIF answered by the /opens endpoint.
pub const TRACKING_PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_pixel_is_a_gif() {
        assert_eq!(&TRACKING_PIXEL[..6], b"GIF89a");
        assert_eq!(*TRACKING_PIXEL.last().unwrap(), 0x3b);
    }
}
