//! Mailjet webhook normalization. Mailjet posts arrays of flat events.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_unix, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let entries: Vec<&serde_json::Value> = match payload.as_array() {
        Some(batch) => batch.iter().collect(),
        None => vec![payload],
    };

    entries.into_iter().filter_map(normalize_event).collect()
}

fn normalize_event(event: &serde_json::Value) -> Option<WebhookEvent> {
    let (kind, is_hard_bounce) = match event["event"].as_str()? {
        "sent" => (EmailEventKind::Delivered, None),
        "bounce" => (
            EmailEventKind::Bounced,
            Some(event["hard_bounce"].as_bool().unwrap_or(false)),
        ),
        "blocked" => (EmailEventKind::Failed, None),
        "spam" => (EmailEventKind::Complained, None),
        "open" => (EmailEventKind::Opened, None),
        "click" => (EmailEventKind::Clicked, None),
        "unsub" => (EmailEventKind::Unsubscribed, None),
        _ => return None,
    };

    let time = event["time"].as_i64().map(timestamp_from_unix)?;

    Some(WebhookEvent {
        provider_message_id: event["MessageID"].as_u64().map(|id| id.to_string()),
        message_id: event["CustomID"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        recipient: event["email"].as_str().map(str::to_string),
        kind,
        time,
        detail: event["error"]
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
    fn test_bounce_batch() {
        let payload = serde_json::json!([
            {
                "event": "bounce",
                "time": 1700000000,
                "email": "x@y.test",
                "MessageID": 1234567890u64,
                "CustomID": "m-1",
                "hard_bounce": true,
                "error": "user unknown"
            },
            {
                "event": "open",
                "time": 1700000100,
                "email": "x@y.test",
                "CustomID": "m-1"
            }
        ]);

        let events = normalize(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EmailEventKind::Bounced);
        assert_eq!(events[0].is_hard_bounce, Some(true));
        assert_eq!(events[0].provider_message_id.as_deref(), Some("1234567890"));
        assert_eq!(events[1].kind, EmailEventKind::Opened);
    }

    #[test]
    fn test_empty_custom_id_dropped() {
        let payload = serde_json::json!({
            "event": "open",
            "time": 1700000000,
            "email": "x@y.test",
            "CustomID": ""
        });
        assert_eq!(normalize(&payload)[0].message_id, None);
    }
}
