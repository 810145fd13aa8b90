use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Integration;

/// A tenant. Every workspace owns its own database; the id doubles as the
/// database-name suffix, hence the alphanumeric/32-char limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub settings: WorkspaceSettings,
    #[serde(default)]
    pub integrations: Vec<Integration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Decrypted per-workspace secret key, HMAC material for unsubscribe
    /// links. Populated in memory only; the encrypt pass clears it before
    /// the settings blob is persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Hex AES-GCM ciphertext of the secret key under the master passphrase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_secret_key: Option<String>,

    #[serde(default)]
    pub email_tracking_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactional_email_integration_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketing_email_integration_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_storage: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blog_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_endpoint_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_blocks: Option<serde_json::Value>,
}

impl Workspace {
    /// Look up an email integration by id.
    pub fn email_integration(&self, integration_id: &str) -> Option<&Integration> {
        self.integrations
            .iter()
            .find(|i| i.id == integration_id && i.email.is_some())
    }

    /// The integration used for transactional sends, when configured.
    pub fn transactional_integration(&self) -> Option<&Integration> {
        self.settings
            .transactional_email_integration_id
            .as_deref()
            .and_then(|id| self.email_integration(id))
    }

    /// The integration used for broadcast/marketing sends, when configured.
    pub fn marketing_integration(&self) -> Option<&Integration> {
        self.settings
            .marketing_email_integration_id
            .as_deref()
            .and_then(|id| self.email_integration(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmailIntegration, EmailProviderKind, IntegrationKind, Sender};

    fn email_integration(id: &str) -> Integration {
        Integration {
            id: id.to_string(),
            name: format!("integration {id}"),
            kind: IntegrationKind::Email,
            email: Some(EmailIntegration {
                provider: EmailProviderKind::Smtp,
                senders: vec![Sender {
                    id: "s-1".to_string(),
                    email: "noreply@acme.test".to_string(),
                    name: "Acme".to_string(),
                    is_default: true,
                }],
                rate_limit_per_minute: 60,
                ..Default::default()
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_integration_lookup() {
        let mut workspace = Workspace {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            settings: WorkspaceSettings {
                transactional_email_integration_id: Some("int-a".to_string()),
                ..Default::default()
            },
            integrations: vec![email_integration("int-a"), email_integration("int-b")],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(workspace.transactional_integration().unwrap().id, "int-a");
        assert!(workspace.marketing_integration().is_none());

        workspace.settings.marketing_email_integration_id = Some("int-b".to_string());
        assert_eq!(workspace.marketing_integration().unwrap().id, "int-b");
    }
}
