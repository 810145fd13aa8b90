//! Postmark webhook normalization.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_rfc3339, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let record_type = payload["RecordType"].as_str().unwrap_or_default();

    let (kind, time_field) = match record_type {
        "Delivery" => (EmailEventKind::Delivered, "DeliveredAt"),
        "Bounce" => (EmailEventKind::Bounced, "BouncedAt"),
        "SpamComplaint" => (EmailEventKind::Complained, "BouncedAt"),
        "Open" => (EmailEventKind::Opened, "ReceivedAt"),
        "Click" => (EmailEventKind::Clicked, "ReceivedAt"),
        "SubscriptionChange" => {
            if payload["SuppressSending"].as_bool().unwrap_or(false) {
                (EmailEventKind::Unsubscribed, "ChangedAt")
            } else {
                return Vec::new();
            }
        }
        _ => return Vec::new(),
    };

    let time = payload[time_field]
        .as_str()
        .map(timestamp_from_rfc3339)
        .unwrap_or_else(chrono::Utc::now);

    let is_hard_bounce = (kind == EmailEventKind::Bounced).then(|| {
        matches!(
            payload["Type"].as_str().unwrap_or_default(),
            "HardBounce" | "BadEmailAddress" | "ManuallyDeactivated" | "Blocked"
        )
    });

    vec![WebhookEvent {
        provider_message_id: payload["MessageID"].as_str().map(str::to_string),
        message_id: payload["Metadata"]["message_id"]
            .as_str()
            .map(str::to_string),
        recipient: payload["Email"]
            .as_str()
            .or_else(|| payload["Recipient"].as_str())
            .map(str::to_string),
        kind,
        time,
        detail: payload["Description"]
            .as_str()
            .or_else(|| payload["Details"].as_str())
            .or_else(|| payload["OriginalLink"].as_str())
            .map(str::to_string),
        is_hard_bounce,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_bounce() {
        let payload = serde_json::json!({
            "RecordType": "Bounce",
            "Type": "HardBounce",
            "MessageID": "pm-1",
            "Email": "x@y.test",
            "BouncedAt": "2024-05-01T10:00:00Z",
            "Description": "The server was unable to deliver your message",
            "Metadata": {"message_id": "m-1"}
        });

        let events = normalize(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EmailEventKind::Bounced);
        assert_eq!(events[0].is_hard_bounce, Some(true));
        assert_eq!(events[0].message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_soft_bounce() {
        let payload = serde_json::json!({
            "RecordType": "Bounce",
            "Type": "Transient",
            "Email": "x@y.test",
            "BouncedAt": "2024-05-01T10:00:00Z"
        });
        assert_eq!(normalize(&payload)[0].is_hard_bounce, Some(false));
    }

    #[test]
    fn test_subscription_change_resubscribe_ignored() {
        let payload = serde_json::json!({
            "RecordType": "SubscriptionChange",
            "SuppressSending": false,
            "Recipient": "x@y.test"
        });
        assert!(normalize(&payload).is_empty());
    }
}
