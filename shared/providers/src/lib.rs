//! Provider adapter layer.
//!
//! One uniform `SendEmail` operation over seven transports, plus the
//! webhook normalizers mapping each vendor's event payloads onto the
//! canonical engagement event set.

pub mod mailgun;
pub mod mailjet;
pub mod oauth;
pub mod postmark;
pub mod sendgrid;
pub mod ses;
pub mod smtp;
pub mod sparkpost;
pub mod webhooks;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mailtide_models::{EmailIntegration, EmailProviderKind};

/// Default per-call send timeout; overridable per provider via config.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub workspace_id: String,
    pub integration_id: String,
    /// Our stable per-recipient message id; tagged onto the provider call
    /// so webhooks can resolve back to it.
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub options: SendEmailOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendEmailOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// RFC 8058 one-click unsubscribe target (https).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe_mailto: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Identifier the provider returned for this send, when it has one.
    pub provider_message_id: Option<String>,
}

/// Errors that can occur during a provider send, classified for retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Worth retrying with backoff: timeouts, 5xx, connection failures.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Never retried: the provider rejected this particular message.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// Credentials are wrong or expired; stops the integration.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// Provider-side throttling.
    #[error("provider rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Classify an HTTP response status per the shared vendor conventions.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {body}")),
            429 => Self::RateLimited {
                retry_after_secs: None,
            },
            500..=599 => Self::Transient(format!("HTTP {status}: {body}")),
            _ => Self::Permanent(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Uniform send operation implemented by every adapter. Adapters are
/// stateless after construction and safe to share across workers.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse>;

    fn kind(&self) -> EmailProviderKind;
}

/// Build the adapter for a decrypted email integration.
///
/// Secret fields must already be decrypted (plaintext side populated) by
/// the workspace registry; a missing plaintext is an auth error, never a
/// reason to read ciphertext here.
pub async fn build_provider(
    email: &EmailIntegration,
    timeout: Duration,
) -> ProviderResult<Box<dyn EmailProvider>> {
    match email.provider {
        EmailProviderKind::Smtp => {
            let settings = email
                .smtp
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing smtp settings".into()))?;
            Ok(Box::new(smtp::SmtpProvider::new(settings.clone(), timeout)?))
        }
        EmailProviderKind::Ses => {
            let settings = email
                .ses
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing ses settings".into()))?;
            Ok(Box::new(ses::SesProvider::new(settings, timeout).await?))
        }
        EmailProviderKind::Sparkpost => {
            let settings = email
                .sparkpost
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing sparkpost settings".into()))?;
            Ok(Box::new(sparkpost::SparkPostProvider::new(settings, timeout)?))
        }
        EmailProviderKind::Postmark => {
            let settings = email
                .postmark
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing postmark settings".into()))?;
            Ok(Box::new(postmark::PostmarkProvider::new(settings, timeout)?))
        }
        EmailProviderKind::Mailgun => {
            let settings = email
                .mailgun
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing mailgun settings".into()))?;
            Ok(Box::new(mailgun::MailgunProvider::new(settings, timeout)?))
        }
        EmailProviderKind::Mailjet => {
            let settings = email
                .mailjet
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing mailjet settings".into()))?;
            Ok(Box::new(mailjet::MailjetProvider::new(settings, timeout)?))
        }
        EmailProviderKind::Sendgrid => {
            let settings = email
                .sendgrid
                .as_ref()
                .ok_or_else(|| ProviderError::Permanent("missing sendgrid settings".into()))?;
            Ok(Box::new(sendgrid::SendGridProvider::new(settings, timeout)?))
        }
    }
}

/// Run a send under the per-call timeout; elapsing counts as transient.
pub async fn send_with_timeout(
    provider: &dyn EmailProvider,
    request: &SendEmailRequest,
    timeout: Duration,
) -> ProviderResult<ProviderResponse> {
    match tokio::time::timeout(timeout, provider.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Transient(format!(
            "provider {} timed out after {}s",
            provider.kind(),
            timeout.as_secs()
        ))),
    }
}

pub(crate) fn http_client(timeout: Duration) -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Permanent(format!("http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(503, "oops"),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(401, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(422, "invalid recipient"),
            ProviderError::Permanent(_)
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(ProviderError::RateLimited {
            retry_after_secs: Some(30)
        }
        .is_retryable());
        assert!(!ProviderError::Permanent("x".into()).is_retryable());
        assert!(!ProviderError::Auth("x".into()).is_retryable());
    }
}
