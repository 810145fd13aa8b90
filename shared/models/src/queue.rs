use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EmailProviderKind, TemplateReference};

/// Origin of a queued email; fixes the default priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Transactional,
    Broadcast,
    Automation,
}

impl SourceKind {
    /// Lower is more urgent.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Transactional => 0,
            Self::Broadcast => 10,
            Self::Automation => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::Broadcast => "broadcast",
            Self::Automation => "automation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transactional" => Some(Self::Transactional),
            "broadcast" => Some(Self::Broadcast),
            "automation" => Some(Self::Automation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Payload rendered at enqueue time. Workers only substitute late-bound
/// values (per-recipient HMAC links) before handing it to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuePayload {
    pub subject: String,
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub from_email: String,
    pub from_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    /// One-click (RFC 8058) unsubscribe target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe_mailto: Option<String>,
    /// Liquid globals for late-bound substitution in the worker.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub template_data: serde_json::Map<String, serde_json::Value>,
}

/// One durable row of the per-workspace outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    /// Internal stable identifier of this recipient send attempt; distinct
    /// from any provider-returned id.
    pub message_id: String,
    pub contact_email: String,
    pub template: TemplateReference,
    pub integration_id: String,
    pub provider: EmailProviderKind,
    pub source: SourceKind,
    pub source_id: String,
    pub priority: i32,
    pub status: QueueStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub payload: QueuePayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form; ids and bookkeeping are assigned by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub message_id: String,
    pub contact_email: String,
    pub template: TemplateReference,
    pub integration_id: String,
    pub provider: EmailProviderKind,
    pub source: SourceKind,
    pub source_id: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub payload: QueuePayload,
}

impl NewQueueItem {
    pub fn with_default_priority(mut self) -> Self {
        self.priority = self.source.default_priority();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands() {
        assert_eq!(SourceKind::Transactional.default_priority(), 0);
        assert_eq!(SourceKind::Broadcast.default_priority(), 10);
        assert_eq!(SourceKind::Automation.default_priority(), 20);
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_payload_serde_skips_empty() {
        let payload = QueuePayload {
            subject: "Hi".to_string(),
            html: "<p>Hi</p>".to_string(),
            from_email: "a@acme.test".to_string(),
            from_name: "Acme".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("cc").is_none());
        assert!(json.get("text").is_none());
        assert!(json.get("template_data").is_none());
    }
}
