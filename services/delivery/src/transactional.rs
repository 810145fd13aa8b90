//! Transactional send entry point.
//!
//! Validates the request, resolves template and integration, renders the
//! payload and enqueues it at the highest priority. Enqueue dedups on
//! (integration_id, message_id), so client-supplied message ids make the
//! call idempotent.

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use mailtide_database::{
    EmailQueueRepository, TemplatesRepository, WorkspaceRegistry,
};
use mailtide_models::{Channel, NewQueueItem, QueuePayload, SourceKind, Workspace};
use mailtide_templates::{urls, CompileRequest, TemplateCompiler, TrackingSettings};
use mailtide_utils::config::{DeliveryConfig, TrackingConfig};
use mailtide_utils::validation::{normalize_email, validate_email_address};
use mailtide_utils::MailtideError;

#[derive(Debug, Clone)]
pub struct TransactionalSend {
    pub contact_email: String,
    pub template_id: String,
    /// Pin a template version; defaults to the latest.
    pub template_version: Option<i32>,
    /// Defaults to the workspace's transactional integration.
    pub integration_id: Option<String>,
    /// Client-supplied idempotency key; generated when absent.
    pub message_id: Option<String>,
    pub external_id: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

pub struct TransactionalSender {
    registry: std::sync::Arc<WorkspaceRegistry>,
    compiler: TemplateCompiler,
    delivery: DeliveryConfig,
    tracking: TrackingConfig,
}

impl TransactionalSender {
    pub fn new(
        registry: std::sync::Arc<WorkspaceRegistry>,
        delivery: DeliveryConfig,
        tracking: TrackingConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            compiler: TemplateCompiler::new()?,
            delivery,
            tracking,
        })
    }

    /// Render and enqueue one transactional email; returns the message id.
    pub async fn enqueue(&self, workspace_id: &str, send: TransactionalSend) -> Result<String> {
        let email = normalize_email(&send.contact_email);
        validate_email_address(&email)?;

        let workspace = self.registry.load_workspace(workspace_id).await?;
        let pool = self.registry.workspace_pool(workspace_id).await?;
        let templates = TemplatesRepository::new(pool.clone());
        let queue = EmailQueueRepository::new(pool);

        let integration_id = send
            .integration_id
            .clone()
            .or_else(|| workspace.settings.transactional_email_integration_id.clone())
            .ok_or_else(|| {
                MailtideError::validation("integration_id", "no transactional integration configured")
            })?;
        let integration = workspace
            .email_integration(&integration_id)
            .ok_or_else(|| MailtideError::validation("integration_id", "unknown integration"))?;
        let email_settings = integration
            .email
            .as_ref()
            .ok_or_else(|| MailtideError::validation("integration_id", "not an email integration"))?;

        let template = match send.template_version {
            Some(version) => {
                templates
                    .find(&mailtide_models::TemplateReference::new(
                        send.template_id.clone(),
                        version,
                    ))
                    .await?
            }
            None => templates.find_latest(&send.template_id).await?,
        }
        .ok_or_else(|| MailtideError::not_found("template"))?;

        let email_template = template
            .email
            .as_ref()
            .ok_or_else(|| MailtideError::validation("template", "template has no email payload"))?;

        let sender = email_settings
            .sender(&email_template.sender_id)
            .or_else(|| email_settings.default_sender())
            .ok_or_else(|| MailtideError::validation("sender", "unknown sender id"))?;

        let message_id = send
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Transactional sends carry no list context; the unsubscribe link
        // is workspace-scoped (empty list fields) and still verifiable via
        // the email HMAC.
        let unsubscribe_url = workspace.settings.secret_key.as_deref().map(|secret| {
            urls::unsubscribe_url(
                &self.tracking.endpoint,
                &email,
                secret,
                "",
                "",
                &message_id,
                &workspace.id,
            )
        });

        let template_data = self.assemble_data(
            &workspace,
            &email,
            &message_id,
            unsubscribe_url.as_deref(),
            send.data.clone(),
        );

        let tracking = TrackingSettings {
            enabled: workspace.settings.email_tracking_enabled,
            endpoint: self.tracking.endpoint.clone(),
            message_id: message_id.clone(),
            workspace_id: workspace.id.clone(),
            timestamp: Utc::now().timestamp(),
            utm: None,
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
            .context("transactional template compilation failed")?;

        let subject = self
            .compiler
            .render_text(&email_template.subject, &template_data)
            .context("subject render failed")?;

        let item = NewQueueItem {
            message_id: message_id.clone(),
            contact_email: email,
            template: template.reference(),
            integration_id: integration_id.clone(),
            provider: email_settings.provider,
            source: SourceKind::Transactional,
            source_id: send.external_id.clone().unwrap_or_default(),
            priority: SourceKind::Transactional.default_priority(),
            max_attempts: self.delivery.max_attempts,
            payload: QueuePayload {
                subject,
                html: compiled.html,
                text: None,
                from_email: sender.email.clone(),
                from_name: sender.name.clone(),
                reply_to: send.reply_to,
                cc: send.cc,
                bcc: send.bcc,
                list_unsubscribe_url: unsubscribe_url,
                list_unsubscribe_mailto: Some(sender.email.clone()),
                template_data: serde_json::Map::new(),
            },
        };

        queue.enqueue(&[item]).await?;
        tracing::info!(workspace_id, message_id = %message_id, "transactional email enqueued");

        Ok(message_id)
    }

    /// Pre-render data for a transactional send: caller data plus the
    /// standard `message_id`, the unsubscribe link and tracking URLs.
    fn assemble_data(
        &self,
        workspace: &Workspace,
        email: &str,
        message_id: &str,
        unsubscribe_url: Option<&str>,
        mut data: serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        data.insert("message_id".to_string(), message_id.into());

        if let Some(url) = unsubscribe_url {
            data.insert("unsubscribe_url".to_string(), url.into());
        }

        if let Some(secret_key) = workspace.settings.secret_key.as_deref() {
            data.insert(
                "notification_center_url".to_string(),
                urls::notification_center_url(
                    &self.tracking.endpoint,
                    email,
                    secret_key,
                    &workspace.id,
                )
                .into(),
            );
        }
        data.insert(
            "tracking_opens_url".to_string(),
            urls::opens_url(
                &self.tracking.endpoint,
                message_id,
                &workspace.id,
                Utc::now().timestamp(),
            )
            .into(),
        );

        data
    }
}
