//! Mailgun webhook normalization.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_unix_f64, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let event_data = &payload["event-data"];
    if event_data.is_null() {
        return Vec::new();
    }

    let (kind, is_hard_bounce) = match event_data["event"].as_str().unwrap_or_default() {
        "accepted" => (EmailEventKind::Sent, None),
        "delivered" => (EmailEventKind::Delivered, None),
        "failed" => {
            let permanent = event_data["severity"].as_str() == Some("permanent");
            (EmailEventKind::Bounced, Some(permanent))
        }
        "complained" => (EmailEventKind::Complained, None),
        "opened" => (EmailEventKind::Opened, None),
        "clicked" => (EmailEventKind::Clicked, None),
        "unsubscribed" => (EmailEventKind::Unsubscribed, None),
        "rejected" => (EmailEventKind::Failed, None),
        _ => return Vec::new(),
    };

    let time = event_data["timestamp"]
        .as_f64()
        .map(timestamp_from_unix_f64)
        .unwrap_or_else(chrono::Utc::now);

    vec![WebhookEvent {
        provider_message_id: event_data["message"]["headers"]["message-id"]
            .as_str()
            .map(str::to_string),
        message_id: event_data["user-variables"]["message_id"]
            .as_str()
            .map(str::to_string),
        recipient: event_data["recipient"].as_str().map(str::to_string),
        kind,
        time,
        detail: event_data["delivery-status"]["message"]
            .as_str()
            .or_else(|| event_data["delivery-status"]["description"].as_str())
            .or_else(|| event_data["url"].as_str())
            .or_else(|| event_data["reason"].as_str())
            .map(str::to_string),
        is_hard_bounce,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_failure_is_hard_bounce() {
        let payload = serde_json::json!({
            "event-data": {
                "event": "failed",
                "severity": "permanent",
                "timestamp": 1700000000.5,
                "recipient": "x@y.test",
                "user-variables": {"message_id": "m-1"},
                "delivery-status": {"message": "550 5.1.1 no such user"}
            }
        });

        let events = normalize(&payload);
        assert_eq!(events[0].kind, EmailEventKind::Bounced);
        assert_eq!(events[0].is_hard_bounce, Some(true));
        assert_eq!(events[0].message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_temporary_failure_is_soft() {
        let payload = serde_json::json!({
            "event-data": {
                "event": "failed",
                "severity": "temporary",
                "timestamp": 1700000000.0,
                "recipient": "x@y.test"
            }
        });
        assert_eq!(normalize(&payload)[0].is_hard_bounce, Some(false));
    }

    #[test]
    fn test_click_event() {
        let payload = serde_json::json!({
            "event-data": {
                "event": "clicked",
                "timestamp": 1700000000.0,
                "recipient": "x@y.test",
                "url": "https://shop.test/"
            }
        });
        let events = normalize(&payload);
        assert_eq!(events[0].kind, EmailEventKind::Clicked);
        assert_eq!(events[0].detail.as_deref(), Some("https://shop.test/"));
    }
}
