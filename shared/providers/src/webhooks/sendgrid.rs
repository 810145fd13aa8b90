//! SendGrid event webhook normalization. Events arrive as a JSON array.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_unix, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let Some(batch) = payload.as_array() else {
        return Vec::new();
    };

    batch.iter().filter_map(normalize_event).collect()
}

fn normalize_event(event: &serde_json::Value) -> Option<WebhookEvent> {
    let (kind, is_hard_bounce) = match event["event"].as_str()? {
        "processed" => (EmailEventKind::Sent, None),
        "delivered" => (EmailEventKind::Delivered, None),
        "bounce" => (
            EmailEventKind::Bounced,
            // "bounce" type means a hard 5xx rejection; "blocked" is soft.
            Some(event["type"].as_str().unwrap_or("bounce") == "bounce"),
        ),
        "dropped" => (EmailEventKind::Failed, None),
        "spamreport" => (EmailEventKind::Complained, None),
        "open" => (EmailEventKind::Opened, None),
        "click" => (EmailEventKind::Clicked, None),
        "unsubscribe" | "group_unsubscribe" => (EmailEventKind::Unsubscribed, None),
        _ => return None,
    };

    let time = event["timestamp"].as_i64().map(timestamp_from_unix)?;

    Some(WebhookEvent {
        provider_message_id: event["sg_message_id"].as_str().map(str::to_string),
        message_id: event["message_id"].as_str().map(str::to_string),
        recipient: event["email"].as_str().map(str::to_string),
        kind,
        time,
        detail: event["reason"]
            .as_str()
            .or_else(|| event["url"].as_str())
            .map(str::to_string),
        is_hard_bounce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_batch() {
        let payload = serde_json::json!([
            {
                "event": "bounce",
                "type": "bounce",
                "timestamp": 1700000000,
                "email": "x@y.test",
                "sg_message_id": "sg-1",
                "message_id": "m-1",
                "reason": "550 5.1.1 user unknown"
            },
            {
                "event": "click",
                "timestamp": 1700000100,
                "email": "x@y.test",
                "message_id": "m-1",
                "url": "https://shop.test/"
            },
            {
                "event": "deferred",
                "timestamp": 1700000200,
                "email": "x@y.test"
            }
        ]);

        let events = normalize(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EmailEventKind::Bounced);
        assert_eq!(events[0].is_hard_bounce, Some(true));
        assert_eq!(events[1].kind, EmailEventKind::Clicked);
    }

    #[test]
    fn test_blocked_bounce_is_soft() {
        let payload = serde_json::json!([{
            "event": "bounce",
            "type": "blocked",
            "timestamp": 1700000000,
            "email": "x@y.test"
        }]);
        assert_eq!(normalize(&payload)[0].is_hard_bounce, Some(false));
    }
}
