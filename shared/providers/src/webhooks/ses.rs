//! SES event normalization.
//!
//! SES publishes through SNS: the interesting payload sits JSON-encoded in
//! the SNS `Message` field, or arrives directly when the configuration set
//! posts to an HTTPS destination.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_rfc3339, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    // Unwrap the SNS envelope when present.
    let event = match payload.get("Message").and_then(|m| m.as_str()) {
        Some(inner) => match serde_json::from_str::<serde_json::Value>(inner) {
            Ok(parsed) => parsed,
            Err(_) => return Vec::new(),
        },
        None => payload.clone(),
    };

    let event_type = event
        .get("eventType")
        .or_else(|| event.get("notificationType"))
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let mail = &event["mail"];
    let provider_message_id = mail["messageId"].as_str().map(str::to_string);
    let message_id = mail["tags"]["message_id"][0]
        .as_str()
        .map(str::to_string);
    let recipient = mail["destination"][0].as_str().map(str::to_string);

    let (kind, section) = match event_type.as_str() {
        "Send" => (EmailEventKind::Sent, "send"),
        "Delivery" => (EmailEventKind::Delivered, "delivery"),
        "Bounce" => (EmailEventKind::Bounced, "bounce"),
        "Complaint" => (EmailEventKind::Complained, "complaint"),
        "Open" => (EmailEventKind::Opened, "open"),
        "Click" => (EmailEventKind::Clicked, "click"),
        "Reject" | "RenderingFailure" => (EmailEventKind::Failed, "failure"),
        _ => return Vec::new(),
    };

    let detail_section = &event[section];
    let time = detail_section["timestamp"]
        .as_str()
        .or_else(|| mail["timestamp"].as_str())
        .map(timestamp_from_rfc3339)
        .unwrap_or_else(chrono::Utc::now);

    let is_hard_bounce = (kind == EmailEventKind::Bounced).then(|| {
        detail_section["bounceType"]
            .as_str()
            .map(|t| t == "Permanent")
            .unwrap_or(true)
    });

    let recipient = match kind {
        EmailEventKind::Bounced => detail_section["bouncedRecipients"][0]["emailAddress"]
            .as_str()
            .map(str::to_string)
            .or(recipient),
        EmailEventKind::Complained => detail_section["complainedRecipients"][0]["emailAddress"]
            .as_str()
            .map(str::to_string)
            .or(recipient),
        _ => recipient,
    };

    let detail = match kind {
        EmailEventKind::Bounced => detail_section["bouncedRecipients"][0]["diagnosticCode"]
            .as_str()
            .map(str::to_string),
        EmailEventKind::Complained => detail_section["complaintFeedbackType"]
            .as_str()
            .map(str::to_string),
        EmailEventKind::Clicked => detail_section["link"].as_str().map(str::to_string),
        EmailEventKind::Failed => detail_section["reason"].as_str().map(str::to_string),
        _ => None,
    };

    vec![WebhookEvent {
        provider_message_id,
        message_id,
        recipient,
        kind,
        time,
        detail,
        is_hard_bounce,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounce_event() {
        let payload = serde_json::json!({
            "eventType": "Bounce",
            "mail": {
                "messageId": "ses-abc",
                "timestamp": "2024-05-01T10:00:00.000Z",
                "destination": ["x@y.test"],
                "tags": {"message_id": ["m-1"]}
            },
            "bounce": {
                "bounceType": "Permanent",
                "timestamp": "2024-05-01T10:00:05.000Z",
                "bouncedRecipients": [{
                    "emailAddress": "x@y.test",
                    "diagnosticCode": "smtp; 550 5.1.1 user unknown"
                }]
            }
        });

        let events = normalize(&payload);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, EmailEventKind::Bounced);
        assert_eq!(event.message_id.as_deref(), Some("m-1"));
        assert_eq!(event.recipient.as_deref(), Some("x@y.test"));
        assert_eq!(event.is_hard_bounce, Some(true));
        assert!(event.detail.as_deref().unwrap().contains("5.1.1"));
    }

    #[test]
    fn test_sns_envelope_unwrapped() {
        let inner = serde_json::json!({
            "eventType": "Open",
            "mail": {"messageId": "ses-abc", "destination": ["x@y.test"],
                     "tags": {"message_id": ["m-1"]}},
            "open": {"timestamp": "2024-05-01T10:00:00.000Z"}
        });
        let payload = serde_json::json!({
            "Type": "Notification",
            "Message": inner.to_string(),
        });

        let events = normalize(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EmailEventKind::Opened);
    }

    #[test]
    fn test_unknown_event_type_ignored() {
        assert!(normalize(&serde_json::json!({"eventType": "Subscription"})).is_empty());
    }
}
