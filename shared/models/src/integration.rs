use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A workspace-scoped binding to an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IntegrationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailIntegration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Email,
    Supabase,
    Llm,
    Firecrawl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailProviderKind {
    Smtp,
    Ses,
    Sparkpost,
    Postmark,
    Mailgun,
    Mailjet,
    Sendgrid,
}

impl std::fmt::Display for EmailProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Smtp => "smtp",
            Self::Ses => "ses",
            Self::Sparkpost => "sparkpost",
            Self::Postmark => "postmark",
            Self::Mailgun => "mailgun",
            Self::Mailjet => "mailjet",
            Self::Sendgrid => "sendgrid",
        };
        write!(f, "{name}")
    }
}

/// Email-provider configuration of an integration. Exactly one provider
/// settings block matches `provider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailIntegration {
    pub provider: EmailProviderKind,
    pub senders: Vec<Sender>,
    pub rate_limit_per_minute: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ses: Option<SesSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparkpost: Option<SparkPostSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postmark: Option<PostmarkSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailgun: Option<MailgunSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailjet: Option<MailjetSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sendgrid: Option<SendGridSettings>,
}

impl Default for EmailIntegration {
    fn default() -> Self {
        Self {
            provider: EmailProviderKind::Smtp,
            senders: Vec::new(),
            rate_limit_per_minute: 60,
            smtp: None,
            ses: None,
            sparkpost: None,
            postmark: None,
            mailgun: None,
            mailjet: None,
            sendgrid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub username: String,

    /// Plaintext password; cleared by the encrypt pass before persistence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<SmtpOauthSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce_mailbox: Option<BounceMailboxSettings>,
    /// Return-Path / envelope sender for DSNs when a bounce mailbox exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OauthProviderKind {
    Microsoft,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpOauthSettings {
    pub provider: OauthProviderKind,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_refresh_token: Option<String>,
    /// Microsoft directory (tenant) id; unused for Google.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// IMAP mailbox that receives DSN/ARF reports for an SMTP integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceMailboxSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    /// Authenticate with XOAUTH2 using the integration's oauth settings
    /// instead of PLAIN/LOGIN.
    #[serde(default)]
    pub use_oauth: bool,
    #[serde(default = "default_mailbox_folder")]
    pub folder: String,
}

fn default_mailbox_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SesSettings {
    pub region: String,
    pub access_key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkPostSettings {
    /// API base, e.g. https://api.sparkpost.com or the EU endpoint.
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_api_key: Option<String>,
    #[serde(default)]
    pub sandbox_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostmarkSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_server_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailgunSettings {
    pub domain: String,
    /// "us" or "eu"; picks the API host.
    #[serde(default = "default_mailgun_region")]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_api_key: Option<String>,
}

fn default_mailgun_region() -> String {
    "us".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailjetSettings {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_secret_key: Option<String>,
    #[serde(default)]
    pub sandbox_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGridSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_api_key: Option<String>,
}

impl EmailIntegration {
    /// The sender flagged as default, or the first one.
    pub fn default_sender(&self) -> Option<&Sender> {
        self.senders
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.senders.first())
    }

    pub fn sender(&self, sender_id: &str) -> Option<&Sender> {
        self.senders.iter().find(|s| s.id == sender_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.senders.is_empty() {
            bail!("email integration requires at least one sender");
        }
        if self.rate_limit_per_minute == 0 {
            bail!("rate_limit_per_minute must be greater than zero");
        }

        let settings_present = match self.provider {
            EmailProviderKind::Smtp => self.smtp.is_some(),
            EmailProviderKind::Ses => self.ses.is_some(),
            EmailProviderKind::Sparkpost => self.sparkpost.is_some(),
            EmailProviderKind::Postmark => self.postmark.is_some(),
            EmailProviderKind::Mailgun => self.mailgun.is_some(),
            EmailProviderKind::Mailjet => self.mailjet.is_some(),
            EmailProviderKind::Sendgrid => self.sendgrid.is_some(),
        };
        if !settings_present {
            bail!("missing settings for provider {}", self.provider);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_integration() -> EmailIntegration {
        EmailIntegration {
            provider: EmailProviderKind::Postmark,
            senders: vec![
                Sender {
                    id: "s-1".to_string(),
                    email: "a@acme.test".to_string(),
                    name: "A".to_string(),
                    is_default: false,
                },
                Sender {
                    id: "s-2".to_string(),
                    email: "b@acme.test".to_string(),
                    name: "B".to_string(),
                    is_default: true,
                },
            ],
            rate_limit_per_minute: 120,
            postmark: Some(PostmarkSettings {
                server_token: Some("token".to_string()),
                encrypted_server_token: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_sender_prefers_flag() {
        let integration = base_integration();
        assert_eq!(integration.default_sender().unwrap().id, "s-2");
    }

    #[test]
    fn test_default_sender_falls_back_to_first() {
        let mut integration = base_integration();
        integration.senders[1].is_default = false;
        assert_eq!(integration.default_sender().unwrap().id, "s-1");
    }

    #[test]
    fn test_validate_requires_sender_and_rate() {
        let mut integration = base_integration();
        assert!(integration.validate().is_ok());

        integration.senders.clear();
        assert!(integration.validate().is_err());

        let mut integration = base_integration();
        integration.rate_limit_per_minute = 0;
        assert!(integration.validate().is_err());
    }

    #[test]
    fn test_validate_requires_matching_settings_block() {
        let mut integration = base_integration();
        integration.provider = EmailProviderKind::Sendgrid;
        assert!(integration.validate().is_err());
    }

    #[test]
    fn test_provider_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&EmailProviderKind::Sparkpost).unwrap(),
            "\"sparkpost\""
        );
        let kind: EmailProviderKind = serde_json::from_str("\"ses\"").unwrap();
        assert_eq!(kind, EmailProviderKind::Ses);
    }
}
