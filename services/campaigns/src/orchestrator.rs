//! Broadcast orchestrator.
//!
//! Drives one broadcast through its phases: audience enumeration with a
//! persisted cursor, the optional A/B test phase with a deterministic
//! recipient partition, winner selection from the engagement timeline, and
//! the sending-phase sweep. Every status transition is persisted before
//! the enqueue work it gates, so the orchestrator can resume from any
//! state after a crash; the queue's (integration_id, message_id) dedup
//! absorbs whatever overlap a half-written batch left behind.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

use mailtide_database::{
    AudienceMember, BroadcastsRepository, ContactsRepository, EmailQueueRepository,
    MessageHistoryRepository, TemplatesRepository, VariationStats,
};
use mailtide_models::{
    Broadcast, BroadcastStatus, Channel, EmailIntegration, NewQueueItem, QueuePayload,
    SourceKind, Template, TemplateReference, Variation, WinnerMetric, Workspace,
};
use mailtide_templates::{urls, CompileRequest, TemplateCompiler, TrackingSettings, UtmParams};
use mailtide_utils::config::{DeliveryConfig, TrackingConfig};

use crate::audience::AudienceEnumerator;

const AUDIENCE_BATCH_SIZE: i64 = 200;

pub struct BroadcastOrchestrator {
    workspace: Workspace,
    broadcasts: BroadcastsRepository,
    contacts: ContactsRepository,
    templates: TemplatesRepository,
    history: MessageHistoryRepository,
    queue: EmailQueueRepository,
    compiler: TemplateCompiler,
    tracking: TrackingConfig,
    delivery: DeliveryConfig,
    batch_size: i64,
}

impl BroadcastOrchestrator {
    pub fn new(
        workspace: Workspace,
        pool: sqlx::PgPool,
        tracking: TrackingConfig,
        delivery: DeliveryConfig,
    ) -> Result<Self> {
        Ok(Self {
            workspace,
            broadcasts: BroadcastsRepository::new(pool.clone()),
            contacts: ContactsRepository::new(pool.clone()),
            templates: TemplatesRepository::new(pool.clone()),
            history: MessageHistoryRepository::new(pool.clone()),
            queue: EmailQueueRepository::new(pool),
            compiler: TemplateCompiler::new()?,
            tracking,
            delivery,
            batch_size: AUDIENCE_BATCH_SIZE,
        })
    }

    /// Override the audience page size (tests exercise multi-batch runs
    /// with small audiences).
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Advance the broadcast as far as it can go right now. Returns with
    /// the broadcast parked (test wait, manual winner, pause) or finished;
    /// the scheduler re-enters on the next tick.
    pub async fn run(&self, broadcast_id: &str) -> Result<()> {
        let mut broadcast = self
            .broadcasts
            .find_by_id(broadcast_id)
            .await?
            .with_context(|| format!("broadcast {broadcast_id} not found"))?;

        loop {
            broadcast = match broadcast.status {
                BroadcastStatus::Scheduled => self.start(broadcast).await?,
                BroadcastStatus::Testing => match self.run_test_phase(broadcast).await? {
                    Some(broadcast) => broadcast,
                    None => return Ok(()),
                },
                BroadcastStatus::TestCompleted => match self.select_winner(broadcast).await? {
                    Some(broadcast) => broadcast,
                    None => return Ok(()),
                },
                BroadcastStatus::WinnerSelected => {
                    // The sending phase sweeps the whole audience again;
                    // recipients the test phase reached dedup away.
                    self.broadcasts.reset_cursor(&broadcast.id).await?;
                    self.broadcasts
                        .transition(&broadcast.id, BroadcastStatus::Sending)
                        .await?
                }
                BroadcastStatus::Sending => {
                    self.run_sending_phase(&broadcast).await?;
                    return Ok(());
                }
                _ => return Ok(()),
            };
        }
    }

    async fn start(&self, broadcast: Broadcast) -> Result<Broadcast> {
        broadcast.validate()?;

        let target = if broadcast.has_ab_test() {
            BroadcastStatus::Testing
        } else {
            BroadcastStatus::Sending
        };
        self.broadcasts.transition(&broadcast.id, target).await
    }

    /// Enqueue the test partition, then wait out the test window as a
    /// timed re-enter: once `test_ends_at` is set this returns None until
    /// the scheduler calls again past the deadline.
    async fn run_test_phase(&self, broadcast: Broadcast) -> Result<Option<Broadcast>> {
        let ab = broadcast
            .ab_test
            .as_ref()
            .context("testing broadcast without A/B settings")?;

        if broadcast.test_ends_at.is_none() {
            let enqueued = self.enqueue_test_partition(&broadcast, ab.test_phase_recipient_count)
                .await?;
            self.broadcasts.set_test_count(&broadcast.id, enqueued).await?;

            let ends_at = Utc::now() + Duration::minutes(ab.test_duration_minutes);
            self.broadcasts.set_test_ends_at(&broadcast.id, ends_at).await?;
            info!(
                broadcast_id = %broadcast.id,
                enqueued,
                %ends_at,
                "test phase enqueued, waiting"
            );
            return Ok(None);
        }

        if broadcast.test_ends_at.is_some_and(|ends| ends <= Utc::now()) {
            let next = self
                .broadcasts
                .transition(&broadcast.id, BroadcastStatus::TestCompleted)
                .await?;
            return Ok(Some(next));
        }

        Ok(None)
    }

    async fn enqueue_test_partition(&self, broadcast: &Broadcast, target: i64) -> Result<i64> {
        let integration = self.resolve_integration(broadcast)?;
        let templates = self.load_variation_templates(broadcast).await?;
        let enumerator =
            AudienceEnumerator::new(&self.contacts, &broadcast.audience, self.batch_size);

        let mut cursor = broadcast.last_cursor.clone();
        let mut enqueued = broadcast.total_recipient_count;

        while enqueued < target {
            if self.reload_status(&broadcast.id).await? != BroadcastStatus::Testing {
                break;
            }

            let batch = enumerator.next_batch(cursor.as_deref()).await?;
            let Some(last) = batch.last() else {
                break;
            };
            let next_cursor = last.contact.email.clone();

            let mut items = Vec::new();
            for member in batch.iter().take((target - enqueued) as usize) {
                let index = variation_index(&broadcast.id, &member.contact.email, templates.len());
                let template = &templates[index];
                items.push(self.render_member(broadcast, template, integration, member)?);
            }

            let inserted = self.queue.enqueue(&items).await? as i64;
            enqueued += inserted;
            self.broadcasts
                .update_cursor(&broadcast.id, &next_cursor, inserted)
                .await?;
            cursor = Some(next_cursor);
        }

        Ok(enqueued)
    }

    async fn select_winner(&self, broadcast: Broadcast) -> Result<Option<Broadcast>> {
        let ab = broadcast
            .ab_test
            .as_ref()
            .context("completed test without A/B settings")?;

        if broadcast.winner_template.is_none() {
            if ab.winner_metric == WinnerMetric::Manual {
                // Parked until an operator picks and moves the status.
                return Ok(None);
            }

            let stats = self.history.variation_stats(&broadcast.id).await?;
            let winner = pick_winner(&broadcast.variations, &stats, ab.winner_metric)
                .context("no variations to pick a winner from")?;

            info!(broadcast_id = %broadcast.id, winner = %winner, "A/B winner selected");
            self.broadcasts.set_winner(&broadcast.id, &winner).await?;
        }

        let next = self
            .broadcasts
            .transition(&broadcast.id, BroadcastStatus::WinnerSelected)
            .await?;
        Ok(Some(next))
    }

    async fn run_sending_phase(&self, broadcast: &Broadcast) -> Result<()> {
        let integration = self.resolve_integration(broadcast)?;
        let reference = broadcast
            .sending_template()
            .context("broadcast has no sending template")?
            .clone();
        let template = self
            .templates
            .find(&reference)
            .await?
            .with_context(|| format!("template {reference} not found"))?;

        let enumerator =
            AudienceEnumerator::new(&self.contacts, &broadcast.audience, self.batch_size);
        let mut cursor = broadcast.last_cursor.clone();

        loop {
            match self.reload_status(&broadcast.id).await? {
                BroadcastStatus::Sending => {}
                status => {
                    info!(broadcast_id = %broadcast.id, %status, "sending phase interrupted");
                    return Ok(());
                }
            }

            let batch = enumerator.next_batch(cursor.as_deref()).await?;
            let Some(last) = batch.last() else {
                self.broadcasts
                    .transition(&broadcast.id, BroadcastStatus::Completed)
                    .await?;
                info!(broadcast_id = %broadcast.id, "broadcast completed");
                return Ok(());
            };
            let next_cursor = last.contact.email.clone();

            // Skip recipients the test phase already reached: their
            // deterministic message ids are on the history.
            let ids: Vec<String> = batch
                .iter()
                .map(|m| message_id_for(&broadcast.id, &m.contact.email))
                .collect();
            let seen: std::collections::HashSet<String> = self
                .history
                .existing_message_ids(&ids)
                .await?
                .into_iter()
                .collect();

            let mut items = Vec::new();
            for member in &batch {
                if seen.contains(&message_id_for(&broadcast.id, &member.contact.email)) {
                    continue;
                }
                items.push(self.render_member(broadcast, &template, integration, member)?);
            }

            let inserted = self.queue.enqueue(&items).await? as i64;
            self.broadcasts
                .update_cursor(&broadcast.id, &next_cursor, inserted)
                .await?;
            cursor = Some(next_cursor);
        }
    }

    async fn reload_status(&self, broadcast_id: &str) -> Result<BroadcastStatus> {
        Ok(self
            .broadcasts
            .find_by_id(broadcast_id)
            .await?
            .with_context(|| format!("broadcast {broadcast_id} disappeared"))?
            .status)
    }

    fn resolve_integration(&self, broadcast: &Broadcast) -> Result<&EmailIntegration> {
        self.workspace
            .email_integration(&broadcast.integration_id)
            .and_then(|i| i.email.as_ref())
            .with_context(|| {
                format!("integration {} not found on workspace", broadcast.integration_id)
            })
    }

    async fn load_variation_templates(&self, broadcast: &Broadcast) -> Result<Vec<Template>> {
        let mut templates = Vec::with_capacity(broadcast.variations.len());
        for variation in &broadcast.variations {
            let template = self
                .templates
                .find(&variation.template)
                .await?
                .with_context(|| format!("template {} not found", variation.template))?;
            templates.push(template);
        }
        if templates.is_empty() {
            bail!("broadcast {} has no variations", broadcast.id);
        }
        Ok(templates)
    }

    /// Compile one recipient's payload and build the queue row.
    fn render_member(
        &self,
        broadcast: &Broadcast,
        template: &Template,
        integration: &EmailIntegration,
        member: &AudienceMember,
    ) -> Result<NewQueueItem> {
        let email_template = template
            .email
            .as_ref()
            .with_context(|| format!("template {} has no email payload", template.id))?;
        let sender = integration
            .sender(&email_template.sender_id)
            .or_else(|| integration.default_sender())
            .context("no usable sender")?;

        let message_id = message_id_for(&broadcast.id, &member.contact.email);
        let secret_key = self
            .workspace
            .settings
            .secret_key
            .as_deref()
            .context("workspace secret key not decrypted")?;

        let unsubscribe = urls::unsubscribe_url(
            &self.tracking.endpoint,
            &member.contact.email,
            secret_key,
            &member.list_id,
            &member.list_name,
            &message_id,
            &self.workspace.id,
        );

        let template_data = self.build_template_data(broadcast, member, &message_id, &unsubscribe, secret_key);

        let tracking = TrackingSettings {
            enabled: self.workspace.settings.email_tracking_enabled,
            endpoint: self.tracking.endpoint.clone(),
            message_id: message_id.clone(),
            workspace_id: self.workspace.id.clone(),
            timestamp: Utc::now().timestamp(),
            utm: Some(UtmParams {
                source: Some(self.workspace.id.clone()),
                medium: Some("email".to_string()),
                campaign: Some(broadcast.name.clone()),
                content: None,
                term: None,
            }),
        };

        let compiled = self
            .compiler
            .compile(&CompileRequest {
                tree: &email_template.visual_tree,
                channel: Channel::Email,
                template_data: template_data.clone(),
                preserve_liquid: false,
                include_block_ids: false,
                tracking: Some(tracking),
            })
            .with_context(|| format!("compiling template {} failed", template.id))?;

        let subject_source = broadcast
            .variations
            .iter()
            .find(|v| v.template.id == template.id && v.template.version == template.version)
            .and_then(|v| v.subject_override.as_deref())
            .unwrap_or(&email_template.subject);
        let subject = self.compiler.render_text(subject_source, &template_data)?;

        Ok(NewQueueItem {
            message_id,
            contact_email: member.contact.email.clone(),
            template: template.reference(),
            integration_id: broadcast.integration_id.clone(),
            provider: integration.provider,
            source: SourceKind::Broadcast,
            source_id: broadcast.id.clone(),
            priority: SourceKind::Broadcast.default_priority(),
            max_attempts: self.delivery.max_attempts,
            payload: QueuePayload {
                subject,
                html: compiled.html,
                text: None,
                from_email: sender.email.clone(),
                from_name: sender.name.clone(),
                reply_to: None,
                cc: Vec::new(),
                bcc: Vec::new(),
                list_unsubscribe_url: Some(unsubscribe),
                list_unsubscribe_mailto: Some(sender.email.clone()),
                template_data: serde_json::Map::new(),
            },
        })
    }

    fn build_template_data(
        &self,
        broadcast: &Broadcast,
        member: &AudienceMember,
        message_id: &str,
        unsubscribe_url: &str,
        secret_key: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();

        if let Ok(contact) = serde_json::to_value(&member.contact) {
            data.insert("contact".to_string(), contact);
        }
        data.insert(
            "broadcast".to_string(),
            serde_json::json!({"id": broadcast.id, "name": broadcast.name}),
        );
        data.insert(
            "list".to_string(),
            serde_json::json!({"id": member.list_id, "name": member.list_name}),
        );
        data.insert("message_id".to_string(), message_id.into());

        data.insert("utm_source".to_string(), self.workspace.id.as_str().into());
        data.insert("utm_medium".to_string(), "email".into());
        data.insert("utm_campaign".to_string(), broadcast.name.as_str().into());

        data.insert("unsubscribe_url".to_string(), unsubscribe_url.into());
        data.insert(
            "confirm_subscription_url".to_string(),
            urls::confirm_subscription_url(
                &self.tracking.endpoint,
                &member.contact.email,
                secret_key,
                &member.list_id,
                &member.list_name,
                message_id,
                &self.workspace.id,
            )
            .into(),
        );
        data.insert(
            "notification_center_url".to_string(),
            urls::notification_center_url(
                &self.tracking.endpoint,
                &member.contact.email,
                secret_key,
                &self.workspace.id,
            )
            .into(),
        );
        data.insert(
            "tracking_opens_url".to_string(),
            urls::opens_url(
                &self.tracking.endpoint,
                message_id,
                &self.workspace.id,
                Utc::now().timestamp(),
            )
            .into(),
        );

        data
    }
}

/// Deterministic message id per (broadcast, recipient): crash-resumed or
/// re-run phases regenerate the same id and dedup instead of double-send.
pub fn message_id_for(broadcast_id: &str, email: &str) -> String {
    let digest = Sha256::digest(format!("{broadcast_id}\u{0}{email}").as_bytes());
    format!("bc-{broadcast_id}-{}", hex::encode(&digest[..12]))
}

/// Deterministic A/B partition: hash(broadcast_id, email) mod variations.
pub fn variation_index(broadcast_id: &str, email: &str, variations: usize) -> usize {
    let digest = Sha256::digest(format!("{broadcast_id}\u{0}{email}").as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % variations.max(1) as u64) as usize
}

/// Winner by metric over the per-variation engagement stats; ties break to
/// the earliest template id (then lowest version). `conversions` counts
/// clicks until a conversion signal exists on the timeline.
pub fn pick_winner(
    variations: &[Variation],
    stats: &[VariationStats],
    metric: WinnerMetric,
) -> Option<TemplateReference> {
    let mut candidates: Vec<&Variation> = variations.iter().collect();
    candidates.sort_by(|a, b| {
        a.template
            .id
            .cmp(&b.template.id)
            .then(a.template.version.cmp(&b.template.version))
    });

    let score = |reference: &TemplateReference| -> i64 {
        stats
            .iter()
            .find(|s| s.template_id == reference.id && s.template_version == reference.version)
            .map(|s| match metric {
                WinnerMetric::Opens => s.opens,
                WinnerMetric::Clicks | WinnerMetric::Conversions => s.clicks,
                WinnerMetric::Manual => 0,
            })
            .unwrap_or(0)
    };

    // Strictly-greater over the id-ordered candidates keeps the earliest
    // template id on ties.
    let mut best: Option<(&Variation, i64)> = None;
    for candidate in candidates {
        let candidate_score = score(&candidate.template);
        if best.map_or(true, |(_, best_score)| candidate_score > best_score) {
            best = Some((candidate, candidate_score));
        }
    }

    best.map(|(variation, _)| variation.template.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variation(id: &str) -> Variation {
        Variation {
            template: TemplateReference::new(id, 1),
            subject_override: None,
        }
    }

    fn stat(id: &str, opens: i64, clicks: i64) -> VariationStats {
        VariationStats {
            template_id: id.to_string(),
            template_version: 1,
            sent: 100,
            opens,
            clicks,
        }
    }

    #[test]
    fn test_partition_is_deterministic_and_in_range() {
        for email in ["a@b.test", "c@d.test", "x@y.test"] {
            let first = variation_index("bc-1", email, 3);
            assert_eq!(first, variation_index("bc-1", email, 3));
            assert!(first < 3);
        }
    }

    #[test]
    fn test_partition_varies_by_broadcast() {
        let spread: std::collections::HashSet<usize> = (0..100)
            .map(|i| variation_index("bc-1", &format!("user{i}@acme.test"), 2))
            .collect();
        // Both arms get recipients.
        assert_eq!(spread.len(), 2);
    }

    #[test]
    fn test_message_id_is_stable() {
        assert_eq!(
            message_id_for("bc-1", "a@b.test"),
            message_id_for("bc-1", "a@b.test")
        );
        assert_ne!(
            message_id_for("bc-1", "a@b.test"),
            message_id_for("bc-2", "a@b.test")
        );
    }

    #[test]
    fn test_winner_by_opens() {
        let variations = [variation("tpl-a"), variation("tpl-b")];
        let stats = [stat("tpl-a", 40, 2), stat("tpl-b", 20, 9)];

        let winner = pick_winner(&variations, &stats, WinnerMetric::Opens).unwrap();
        assert_eq!(winner.id, "tpl-a");

        let winner = pick_winner(&variations, &stats, WinnerMetric::Clicks).unwrap();
        assert_eq!(winner.id, "tpl-b");
    }

    #[test]
    fn test_winner_tie_breaks_to_earliest_template_id() {
        let variations = [variation("tpl-z"), variation("tpl-a")];
        let stats = [stat("tpl-a", 10, 0), stat("tpl-z", 10, 0)];

        let winner = pick_winner(&variations, &stats, WinnerMetric::Opens).unwrap();
        assert_eq!(winner.id, "tpl-a");
    }

    #[test]
    fn test_winner_with_no_stats_falls_back_to_first_id() {
        let variations = [variation("tpl-b"), variation("tpl-a")];
        let winner = pick_winner(&variations, &[], WinnerMetric::Opens).unwrap();
        assert_eq!(winner.id, "tpl-a");
    }
}
