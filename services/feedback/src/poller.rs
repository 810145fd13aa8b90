//! IMAP bounce-mailbox poller.
//!
//! One poller per SMTP integration with a configured bounce mailbox.
//! Fetches unseen messages over IMAP/TLS (PLAIN/LOGIN or XOAUTH2) on a
//! fixed period, runs them through the DSN/ARF parsers with the heuristic
//! fallback, and feeds the results to the engagement recorder. The sync
//! IMAP client runs inside `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mailtide_database::EngagementRecorder;
use mailtide_models::{BounceMailboxSettings, EmailEvent, EmailEventKind, SmtpSettings};
use mailtide_providers::oauth::{self, xoauth2_initial_response};

use crate::arf::parse_arf;
use crate::dsn::parse_dsn;
use crate::heuristic::{heuristic_bounce, is_complaint_candidate};

pub struct BouncePoller {
    workspace_id: String,
    integration_id: String,
    smtp: SmtpSettings,
    recorder: Arc<EngagementRecorder>,
    interval: Duration,
}

enum MailboxAuth {
    Password(String),
    Xoauth2 { user: String, access_token: String },
}

struct XOAuth2Authenticator {
    user: String,
    access_token: String,
}

impl imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        xoauth2_initial_response(&self.user, &self.access_token)
    }
}

impl BouncePoller {
    pub fn new(
        workspace_id: String,
        integration_id: String,
        smtp: SmtpSettings,
        recorder: Arc<EngagementRecorder>,
        interval: Duration,
    ) -> Self {
        Self {
            workspace_id,
            integration_id,
            smtp,
            recorder,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workspace_id = %self.workspace_id,
            integration_id = %self.integration_id,
            "bounce mailbox poller started"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                // Temporary IMAP failures just wait out the next period.
                error!(
                    workspace_id = %self.workspace_id,
                    integration_id = %self.integration_id,
                    error = %e,
                    "bounce mailbox poll failed"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!(integration_id = %self.integration_id, "bounce mailbox poller stopped");
    }

    pub async fn poll_once(&self) -> Result<usize> {
        let mailbox = self
            .smtp
            .bounce_mailbox
            .clone()
            .context("integration has no bounce mailbox")?;

        let auth = if mailbox.use_oauth {
            let oauth_settings = self
                .smtp
                .oauth
                .as_ref()
                .context("XOAUTH2 mailbox without oauth settings")?;
            let token = oauth::fetch_access_token(oauth_settings)
                .await
                .context("bounce mailbox token exchange failed")?;
            MailboxAuth::Xoauth2 {
                user: mailbox.username.clone(),
                access_token: token,
            }
        } else {
            MailboxAuth::Password(
                mailbox
                    .password
                    .clone()
                    .context("bounce mailbox password not decrypted")?,
            )
        };

        let messages =
            tokio::task::spawn_blocking(move || fetch_unseen(&mailbox, auth)).await??;

        let mut recorded = 0;
        for raw in &messages {
            match self.process_message(raw).await {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to process mailbox message"),
            }
        }

        if !messages.is_empty() {
            info!(
                integration_id = %self.integration_id,
                fetched = messages.len(),
                recorded,
                "bounce mailbox processed"
            );
        }
        Ok(recorded)
    }

    /// DSN first, then ARF, then the heuristics. Returns whether an event
    /// was recorded.
    async fn process_message(&self, raw: &[u8]) -> Result<bool> {
        if let Some(report) = parse_dsn(raw) {
            let event = EmailEvent {
                message_id: report.original_message_id.clone(),
                recipient: report.recipient.clone(),
                kind: EmailEventKind::Bounced,
                time: report.arrival_date.unwrap_or_else(Utc::now),
                detail: report.diagnostic.clone(),
                is_hard_bounce: Some(report.is_hard_bounce),
                email_hmac: None,
                list_ids: Vec::new(),
            };
            return self.recorder.apply(&event).await;
        }

        if let Some(report) = parse_arf(raw) {
            if !report.is_complaint() {
                debug!(feedback_type = %report.feedback_type, "ignoring non-complaint ARF report");
                return Ok(false);
            }
            let event = EmailEvent {
                message_id: report.original_message_id.clone(),
                recipient: report.recipient.clone(),
                kind: EmailEventKind::Complained,
                time: report.arrival_date.unwrap_or_else(Utc::now),
                detail: Some(report.feedback_type.clone()),
                is_hard_bounce: None,
                email_hmac: None,
                list_ids: Vec::new(),
            };
            return self.recorder.apply(&event).await;
        }

        if let Some(report) = heuristic_bounce(raw) {
            let event = EmailEvent {
                message_id: report.original_message_id.clone(),
                recipient: report.recipient.clone(),
                kind: EmailEventKind::Bounced,
                time: Utc::now(),
                detail: report.diagnostic.clone(),
                is_hard_bounce: Some(report.is_hard_bounce),
                email_hmac: None,
                list_ids: Vec::new(),
            };
            return self.recorder.apply(&event).await;
        }

        if is_complaint_candidate(raw) {
            let event = EmailEvent {
                message_id: None,
                recipient: None,
                kind: EmailEventKind::Complained,
                time: Utc::now(),
                detail: Some("complaint heuristics".to_string()),
                is_hard_bounce: None,
                email_hmac: None,
                list_ids: Vec::new(),
            };
            return self.recorder.apply(&event).await;
        }

        debug!("mailbox message is neither DSN, ARF nor a recognizable bounce");
        Ok(false)
    }
}

/// Blocking IMAP fetch of unseen messages, marking them seen.
fn fetch_unseen(mailbox: &BounceMailboxSettings, auth: MailboxAuth) -> Result<Vec<Vec<u8>>> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("TLS connector")?;

    let client = imap::connect(
        (mailbox.host.as_str(), mailbox.port),
        mailbox.host.as_str(),
        &tls,
    )
    .context("IMAP connect failed")?;

    let mut session = match auth {
        MailboxAuth::Password(password) => client
            .login(&mailbox.username, &password)
            .map_err(|(e, _)| e)
            .context("IMAP login failed")?,
        MailboxAuth::Xoauth2 { user, access_token } => client
            .authenticate(
                "XOAUTH2",
                &XOAuth2Authenticator {
                    user,
                    access_token,
                },
            )
            .map_err(|(e, _)| e)
            .context("IMAP XOAUTH2 authentication failed")?,
    };

    session
        .select(&mailbox.folder)
        .with_context(|| format!("IMAP select {} failed", mailbox.folder))?;

    let unseen = session.search("UNSEEN").context("IMAP search failed")?;
    if unseen.is_empty() {
        session.logout().ok();
        return Ok(Vec::new());
    }

    let mut messages = Vec::with_capacity(unseen.len());
    for seq in unseen {
        let fetches = session
            .fetch(seq.to_string(), "RFC822")
            .with_context(|| format!("IMAP fetch {seq} failed"))?;
        for fetch in fetches.iter() {
            if let Some(body) = fetch.body() {
                messages.push(body.to_vec());
            }
        }
        session
            .store(seq.to_string(), "+FLAGS (\\Seen)")
            .with_context(|| format!("IMAP store {seq} failed"))?;
    }

    session.logout().ok();
    Ok(messages)
}
