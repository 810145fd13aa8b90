//! Send workers.
//!
//! A bounded pool per workspace. Each worker claims a small batch, then per
//! row: cancellation check, rate-limiter acquire, late-bound Liquid
//! substitution, provider dispatch under timeout, outcome recording. A row
//! is only ever held by one worker (claims are atomic), and outcomes land
//! in claim order within a worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mailtide_database::repositories::FailureOutcome;
use mailtide_database::{
    BroadcastsRepository, EmailQueueRepository, MessageHistoryRepository, WorkspaceRegistry,
};
use mailtide_models::{BroadcastStatus, EmailEventKind, QueueItem, SourceKind, Workspace};
use mailtide_providers::{
    build_provider, send_with_timeout, ProviderError, SendEmailOptions, SendEmailRequest,
};
use mailtide_templates::engine::{contains_liquid_syntax, globals_from_json, LiquidEngine};
use mailtide_utils::config::DeliveryConfig;

use crate::rate_limit::RateLimiterRegistry;

/// Everything the workers of one workspace share.
pub struct WorkspaceDelivery {
    pub workspace: Workspace,
    pub queue: EmailQueueRepository,
    pub history: MessageHistoryRepository,
    pub broadcasts: BroadcastsRepository,
    pub registry: Arc<WorkspaceRegistry>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub config: DeliveryConfig,
    pub engine: LiquidEngine,
}

pub struct SendWorker {
    id: String,
    shared: Arc<WorkspaceDelivery>,
}

impl SendWorker {
    pub fn new(index: usize, shared: Arc<WorkspaceDelivery>) -> Self {
        Self {
            id: format!("{}-worker-{index}", shared.workspace.id),
            shared,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "send worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self
                .shared
                .queue
                .claim(&self.id, self.shared.config.claim_batch_size, Utc::now())
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "queue claim failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                // Idle poll; also the point where shutdown interrupts.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for item in batch {
                // Drain the already-claimed batch even when shutting down;
                // rows are released, not dropped.
                if *shutdown.borrow() {
                    let _ = self.shared.queue.release(item.id, Utc::now()).await;
                    continue;
                }
                if let Err(e) = self.process(item).await {
                    error!(worker = %self.id, error = %e, "row processing failed");
                }
            }
        }

        info!(worker = %self.id, "send worker stopped");
    }

    async fn process(&self, item: QueueItem) -> Result<()> {
        let now = Utc::now();

        // Cancellation gate: a paused broadcast keeps its rows, a
        // cancelled one drops them.
        if item.source == SourceKind::Broadcast {
            match self.broadcast_status(&item.source_id).await? {
                Some(BroadcastStatus::Paused) => {
                    self.shared.queue.release(item.id, now).await?;
                    return Ok(());
                }
                Some(BroadcastStatus::Cancelled) => {
                    debug!(message_id = %item.message_id, "dropping row of cancelled broadcast");
                    self.shared.queue.ack_success(item.id).await?;
                    return Ok(());
                }
                _ => {}
            }
        }

        let Some(integration) = self
            .shared
            .workspace
            .email_integration(&item.integration_id)
            .and_then(|i| i.email.as_ref())
        else {
            // Unknown integration is a validation error, never retried.
            self.shared
                .queue
                .ack_failure(item.id, "unknown integration", false, now)
                .await?;
            self.record_failure(&item).await?;
            return Ok(());
        };

        self.shared
            .rate_limiters
            .acquire(&item.integration_id, integration.rate_limit_per_minute)
            .await;

        let request = match self.build_request(&item) {
            Ok(request) => request,
            Err(e) => {
                self.shared
                    .queue
                    .ack_failure(item.id, &e.to_string(), false, now)
                    .await?;
                self.record_failure(&item).await?;
                return Ok(());
            }
        };

        let timeout = Duration::from_secs(self.shared.config.provider_timeout_seconds);
        let outcome = match build_provider(integration, timeout).await {
            Ok(provider) => send_with_timeout(provider.as_ref(), &request, timeout).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(response) => {
                self.shared.history.record_send(&item, Utc::now()).await?;
                self.shared.queue.ack_success(item.id).await?;
                debug!(
                    message_id = %item.message_id,
                    provider_message_id = ?response.provider_message_id,
                    "email sent"
                );
            }
            Err(ProviderError::Auth(message)) => {
                self.handle_auth_failure(&item, &message).await?;
            }
            Err(error) => {
                let retryable = error.is_retryable();
                let outcome = self
                    .shared
                    .queue
                    .ack_failure(item.id, &error.to_string(), retryable, Utc::now())
                    .await?;
                if outcome == FailureOutcome::Exhausted {
                    self.record_failure(&item).await?;
                }
            }
        }

        Ok(())
    }

    /// Auth failures stop the integration: alert the operator, pause the
    /// broadcasts using it, and put the row back untouched for resume.
    async fn handle_auth_failure(&self, item: &QueueItem, message: &str) -> Result<()> {
        warn!(
            integration_id = %item.integration_id,
            message,
            "provider authentication failed"
        );

        self.shared
            .registry
            .record_operator_alert(
                &self.shared.workspace.id,
                &item.integration_id,
                "provider_auth",
                message,
            )
            .await?;

        if item.source == SourceKind::Broadcast {
            if let Some(BroadcastStatus::Sending | BroadcastStatus::Testing) =
                self.broadcast_status(&item.source_id).await?
            {
                self.shared
                    .broadcasts
                    .transition(&item.source_id, BroadcastStatus::Paused)
                    .await
                    .ok();
            }
        }

        self.shared.queue.release(item.id, Utc::now()).await?;
        Ok(())
    }

    async fn broadcast_status(&self, broadcast_id: &str) -> Result<Option<BroadcastStatus>> {
        Ok(self
            .shared
            .broadcasts
            .find_by_id(broadcast_id)
            .await?
            .map(|b| b.status))
    }

    /// Late-bound substitution: payloads are rendered at enqueue time, but
    /// per-recipient data (signed links) may still be Liquid expressions.
    fn build_request(&self, item: &QueueItem) -> Result<SendEmailRequest> {
        let payload = &item.payload;

        let (subject, html) = if !payload.template_data.is_empty()
            && (contains_liquid_syntax(&payload.html) || contains_liquid_syntax(&payload.subject))
        {
            let globals = globals_from_json(&payload.template_data)?;
            let subject = self
                .shared
                .engine
                .render(&payload.subject, &globals)
                .context("late-bound subject render")?;
            let html = self
                .shared
                .engine
                .render(&payload.html, &globals)
                .context("late-bound body render")?;
            (subject, html)
        } else {
            (payload.subject.clone(), payload.html.clone())
        };

        Ok(SendEmailRequest {
            workspace_id: self.shared.workspace.id.clone(),
            integration_id: item.integration_id.clone(),
            message_id: item.message_id.clone(),
            from_address: payload.from_email.clone(),
            from_name: payload.from_name.clone(),
            to: item.contact_email.clone(),
            subject,
            html,
            options: SendEmailOptions {
                text: payload.text.clone(),
                reply_to: payload.reply_to.clone(),
                cc: payload.cc.clone(),
                bcc: payload.bcc.clone(),
                attachments: Vec::new(),
                list_unsubscribe_url: payload.list_unsubscribe_url.clone(),
                list_unsubscribe_mailto: payload.list_unsubscribe_mailto.clone(),
            },
        })
    }

    async fn record_failure(&self, item: &QueueItem) -> Result<()> {
        self.shared
            .history
            .apply_event(
                &item.message_id,
                EmailEventKind::Failed,
                Utc::now(),
                Some(&item.contact_email),
            )
            .await?;
        Ok(())
    }
}

/// Periodic sweep releasing rows whose lease expired (worker died between
/// claim and ack).
pub async fn recovery_loop(
    queue: Arc<EmailQueueRepository>,
    config: DeliveryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let lease = chrono::Duration::seconds(config.lease_seconds);
    let interval = Duration::from_secs(config.recovery_interval_seconds);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = queue.recover(lease, Utc::now()).await {
            error!(error = %e, "queue recovery sweep failed");
        }
    }
}

