//! Engagement recorder.
//!
//! Single entry point for every normalized engagement event regardless of
//! origin (worker outcome, provider webhook, DSN/ARF report, tracking
//! endpoint). Applies the monotonic timestamp to the message history, then
//! the side effects: membership suppression on bounces and complaints, the
//! contact-wide deliverability flag on repeated hard bounces, and HMAC
//! verification on unsubscribes.

use anyhow::Result;
use sqlx::PgPool;

use mailtide_models::{EmailEvent, EmailEventKind, MembershipStatus};
use mailtide_utils::crypto::verify_email_hmac;

use crate::repositories::{
    ContactsRepository, ListsRepository, MessageHistoryRepository,
};

/// Hard bounces on this many lists raise the contact-wide flag.
const DELIVERABILITY_FLAG_THRESHOLD: i64 = 2;

pub struct EngagementRecorder {
    history: MessageHistoryRepository,
    lists: ListsRepository,
    contacts: ContactsRepository,
    workspace_secret_key: String,
}

impl EngagementRecorder {
    pub fn new(pool: PgPool, workspace_secret_key: String) -> Self {
        Self {
            history: MessageHistoryRepository::new(pool.clone()),
            lists: ListsRepository::new(pool.clone()),
            contacts: ContactsRepository::new(pool),
            workspace_secret_key,
        }
    }

    pub fn history(&self) -> &MessageHistoryRepository {
        &self.history
    }

    /// Apply one event. Returns false when the event was dropped (bad
    /// HMAC, or no way to resolve a message).
    pub async fn apply(&self, event: &EmailEvent) -> Result<bool> {
        // Signed unsubscribe requests must verify; a mismatch drops the
        // event without touching any state.
        if event.kind == EmailEventKind::Unsubscribed {
            if let (Some(hmac), Some(recipient)) = (&event.email_hmac, &event.recipient) {
                if !verify_email_hmac(recipient, &self.workspace_secret_key, hmac) {
                    tracing::warn!(recipient, "unsubscribe dropped: HMAC mismatch");
                    return Ok(false);
                }
            }
        }

        let (message_id, recipient) = self.resolve(event).await?;
        let Some(message_id) = message_id else {
            tracing::warn!(kind = %event.kind, "engagement event dropped: no message id");
            return Ok(false);
        };

        self.history
            .apply_event(&message_id, event.kind, event.time, recipient.as_deref())
            .await?;

        // A click necessarily means the mail was opened.
        if event.kind == EmailEventKind::Clicked {
            self.history
                .apply_event(&message_id, EmailEventKind::Opened, event.time, recipient.as_deref())
                .await?;
        }

        if let Some(recipient) = &recipient {
            self.apply_contact_effects(event, recipient).await?;
        }

        Ok(true)
    }

    /// Fill in whichever of (message id, recipient) the event is missing,
    /// using the message history as the join table.
    async fn resolve(&self, event: &EmailEvent) -> Result<(Option<String>, Option<String>)> {
        match (&event.message_id, &event.recipient) {
            (Some(id), Some(recipient)) => Ok((Some(id.clone()), Some(recipient.clone()))),
            (Some(id), None) => {
                let recipient = self
                    .history
                    .find_by_message_id(id)
                    .await?
                    .map(|h| h.contact_email);
                Ok((Some(id.clone()), recipient))
            }
            (None, Some(recipient)) => {
                let message_id = self
                    .history
                    .find_latest_by_email(recipient)
                    .await?
                    .map(|h| h.message_id);
                Ok((message_id, Some(recipient.clone())))
            }
            (None, None) => Ok((None, None)),
        }
    }

    async fn apply_contact_effects(&self, event: &EmailEvent, recipient: &str) -> Result<()> {
        match event.kind {
            EmailEventKind::Bounced => {
                // Soft bounces leave memberships alone.
                if event.is_hard_bounce == Some(false) {
                    return Ok(());
                }
                self.lists
                    .update_status_all_lists(recipient, MembershipStatus::Bounced)
                    .await?;

                let bounced_lists = self
                    .lists
                    .count_with_status(recipient, MembershipStatus::Bounced)
                    .await?;
                if bounced_lists >= DELIVERABILITY_FLAG_THRESHOLD {
                    self.contacts.flag_deliverability(recipient).await?;
                    tracing::info!(recipient, bounced_lists, "contact deliverability flagged");
                }
            }
            EmailEventKind::Complained => {
                self.lists
                    .update_status_all_lists(recipient, MembershipStatus::Complained)
                    .await?;
            }
            EmailEventKind::Unsubscribed => {
                if event.list_ids.is_empty() {
                    self.lists
                        .update_status_all_lists(recipient, MembershipStatus::Unsubscribed)
                        .await?;
                } else {
                    for list_id in &event.list_ids {
                        self.lists
                            .update_status(recipient, list_id, MembershipStatus::Unsubscribed)
                            .await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
