//! Provider webhook normalization.
//!
//! Every provider posts its own payload shape; each normalizer extracts
//! `{message id | recipient, event kind, event time, detail}` and maps the
//! vendor event taxonomy onto the canonical engagement set. Per event kind
//! the earliest seen timestamp wins.

pub mod mailgun;
pub mod mailjet;
pub mod postmark;
pub mod sendgrid;
pub mod ses;
pub mod sparkpost;

use chrono::{DateTime, TimeZone, Utc};

use mailtide_models::{EmailEvent, EmailEventKind, EmailProviderKind};

/// A provider event mapped onto the canonical set.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// The id the provider assigned to the send.
    pub provider_message_id: Option<String>,
    /// Our message id, recovered from metadata/custom args when the adapter
    /// tagged the send.
    pub message_id: Option<String>,
    pub recipient: Option<String>,
    pub kind: EmailEventKind,
    pub time: DateTime<Utc>,
    pub detail: Option<String>,
    pub is_hard_bounce: Option<bool>,
}

impl WebhookEvent {
    pub fn into_email_event(self) -> EmailEvent {
        EmailEvent {
            message_id: self.message_id,
            recipient: self.recipient,
            kind: self.kind,
            time: self.time,
            detail: self.detail,
            is_hard_bounce: self.is_hard_bounce,
            email_hmac: None,
            list_ids: Vec::new(),
        }
    }
}

/// Dispatch a raw webhook payload to the provider's normalizer.
pub fn normalize(provider: EmailProviderKind, payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let events = match provider {
        EmailProviderKind::Ses => ses::normalize(payload),
        EmailProviderKind::Sparkpost => sparkpost::normalize(payload),
        EmailProviderKind::Postmark => postmark::normalize(payload),
        EmailProviderKind::Mailgun => mailgun::normalize(payload),
        EmailProviderKind::Mailjet => mailjet::normalize(payload),
        EmailProviderKind::Sendgrid => sendgrid::normalize(payload),
        // Plain SMTP has no webhook channel; feedback arrives via the
        // bounce mailbox instead.
        EmailProviderKind::Smtp => Vec::new(),
    };

    earliest_per_kind(events)
}

/// Collapse duplicate kinds for the same message, keeping the earliest
/// timestamp of each.
pub(crate) fn earliest_per_kind(mut events: Vec<WebhookEvent>) -> Vec<WebhookEvent> {
    events.sort_by_key(|e| e.time);
    let mut out: Vec<WebhookEvent> = Vec::with_capacity(events.len());
    for event in events {
        let duplicate = out.iter().any(|seen| {
            seen.kind == event.kind
                && seen.message_id == event.message_id
                && seen.recipient == event.recipient
        });
        if !duplicate {
            out.push(event);
        }
    }
    out
}

pub(crate) fn timestamp_from_unix(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}

pub(crate) fn timestamp_from_unix_f64(seconds: f64) -> DateTime<Utc> {
    timestamp_from_unix(seconds as i64)
}

pub(crate) fn timestamp_from_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_per_kind() {
        let later = WebhookEvent {
            provider_message_id: None,
            message_id: Some("m-1".to_string()),
            recipient: None,
            kind: EmailEventKind::Opened,
            time: timestamp_from_unix(2000),
            detail: None,
            is_hard_bounce: None,
        };
        let earlier = WebhookEvent {
            time: timestamp_from_unix(1000),
            ..later.clone()
        };
        let other_kind = WebhookEvent {
            kind: EmailEventKind::Clicked,
            ..later.clone()
        };

        let out = earliest_per_kind(vec![later, earlier.clone(), other_kind.clone()]);
        assert_eq!(out.len(), 2);
        assert!(out.contains(&earlier));
        assert!(out.contains(&other_kind));
    }

    #[test]
    fn test_smtp_has_no_webhooks() {
        assert!(normalize(EmailProviderKind::Smtp, &serde_json::json!({})).is_empty());
    }
}
