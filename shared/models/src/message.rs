use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TemplateReference;

/// Canonical engagement event kinds. Every provider webhook, DSN report and
/// tracking hit normalizes into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventKind {
    Sent,
    Delivered,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
    Failed,
}

impl EmailEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Unsubscribed => "unsubscribed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "bounced" => Some(Self::Bounced),
            "complained" => Some(Self::Complained),
            "opened" => Some(Self::Opened),
            "clicked" => Some(Self::Clicked),
            "unsubscribed" => Some(Self::Unsubscribed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EmailEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A normalized engagement event on its way to the message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailEvent {
    /// Our message id when known; otherwise the recorder resolves it from
    /// the recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub kind: EmailEventKind,
    pub time: DateTime<Utc>,
    /// Diagnostic text, click URL, complaint feedback type, failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Bounce classification, when the source distinguishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hard_bounce: Option<bool>,
    /// Signed unsubscribe requests carry the link HMAC for verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_hmac: Option<String>,
    /// Lists named by the unsubscribe link, when scoped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_ids: Vec<String>,
}

impl EmailEvent {
    pub fn new(kind: EmailEventKind, message_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            recipient: None,
            kind,
            time,
            detail: None,
            is_hard_bounce: None,
            email_hmac: None,
            list_ids: Vec::new(),
        }
    }
}

/// One row of the per-workspace engagement timeline. Every `*_at` column is
/// set at most once; repeat events bump the counters instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistory {
    pub message_id: String,
    pub channel: String,
    pub contact_email: String,
    pub template: TemplateReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,
    /// Client-supplied correlation id on transactional sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub open_count: i32,
    pub click_count: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageHistory {
    pub fn timestamp_for(&self, kind: EmailEventKind) -> Option<DateTime<Utc>> {
        match kind {
            EmailEventKind::Sent => self.sent_at,
            EmailEventKind::Delivered => self.delivered_at,
            EmailEventKind::Bounced => self.bounced_at,
            EmailEventKind::Complained => self.complained_at,
            EmailEventKind::Opened => self.opened_at,
            EmailEventKind::Clicked => self.clicked_at,
            EmailEventKind::Unsubscribed => self.unsubscribed_at,
            EmailEventKind::Failed => self.failed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EmailEventKind::Sent,
            EmailEventKind::Delivered,
            EmailEventKind::Bounced,
            EmailEventKind::Complained,
            EmailEventKind::Opened,
            EmailEventKind::Clicked,
            EmailEventKind::Unsubscribed,
            EmailEventKind::Failed,
        ] {
            assert_eq!(EmailEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EmailEventKind::parse("queued"), None);
    }

    #[test]
    fn test_timestamp_lookup() {
        let now = Utc::now();
        let history = MessageHistory {
            message_id: "m-1".to_string(),
            channel: "email".to_string(),
            contact_email: "a@b.test".to_string(),
            template: TemplateReference::new("tpl-1", 1),
            broadcast_id: None,
            automation_id: None,
            external_id: None,
            sent_at: Some(now),
            delivered_at: None,
            bounced_at: None,
            complained_at: None,
            opened_at: None,
            clicked_at: None,
            unsubscribed_at: None,
            failed_at: None,
            open_count: 0,
            click_count: 0,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(history.timestamp_for(EmailEventKind::Sent), Some(now));
        assert_eq!(history.timestamp_for(EmailEventKind::Opened), None);
    }
}
