//! SparkPost event normalization.
//!
//! SparkPost posts a batch array; each entry nests the event under
//! `msys.message_event` / `msys.track_event` / `msys.unsubscribe_event`.

use mailtide_models::EmailEventKind;

use super::{timestamp_from_unix, WebhookEvent};

pub fn normalize(payload: &serde_json::Value) -> Vec<WebhookEvent> {
    let Some(batch) = payload.as_array() else {
        return Vec::new();
    };

    batch
        .iter()
        .filter_map(|entry| {
            let msys = entry.get("msys")?;
            let event = msys
                .get("message_event")
                .or_else(|| msys.get("track_event"))
                .or_else(|| msys.get("unsubscribe_event"))?;
            normalize_event(event)
        })
        .collect()
}

fn normalize_event(event: &serde_json::Value) -> Option<WebhookEvent> {
    let kind = match event["type"].as_str()? {
        "injection" => EmailEventKind::Sent,
        "delivery" => EmailEventKind::Delivered,
        "bounce" | "out_of_band" => EmailEventKind::Bounced,
        "spam_complaint" => EmailEventKind::Complained,
        "open" | "initial_open" => EmailEventKind::Opened,
        "click" => EmailEventKind::Clicked,
        "list_unsubscribe" | "link_unsubscribe" => EmailEventKind::Unsubscribed,
        "policy_rejection" | "generation_failure" | "generation_rejection" => {
            EmailEventKind::Failed
        }
        _ => return None,
    };

    let time = event["timestamp"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| event["timestamp"].as_i64())
        .map(timestamp_from_unix)
        .unwrap_or_else(chrono::Utc::now);

    // Bounce classes 10 (invalid recipient), 30 (no rcpt) and 90
    // (unsubscribe) are hard in SparkPost's classification table.
    let is_hard_bounce = (kind == EmailEventKind::Bounced).then(|| {
        event["bounce_class"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| event["bounce_class"].as_i64())
            .map(|class| matches!(class, 10 | 30 | 90))
            .unwrap_or(false)
    });

    Some(WebhookEvent {
        provider_message_id: event["message_id"].as_str().map(str::to_string),
        message_id: event["rcpt_meta"]["message_id"]
            .as_str()
            .map(str::to_string),
        recipient: event["rcpt_to"].as_str().map(str::to_string),
        kind,
        time,
        detail: event["reason"]
            .as_str()
            .or_else(|| event["target_link_url"].as_str())
            .map(str::to_string),
        is_hard_bounce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_normalization() {
        let payload = serde_json::json!([
            {"msys": {"message_event": {
                "type": "bounce",
                "bounce_class": "10",
                "timestamp": "1700000000",
                "rcpt_to": "x@y.test",
                "message_id": "sp-1",
                "rcpt_meta": {"message_id": "m-1"},
                "reason": "550 5.1.1 unknown user"
            }}},
            {"msys": {"track_event": {
                "type": "click",
                "timestamp": 1700000100,
                "rcpt_to": "x@y.test",
                "rcpt_meta": {"message_id": "m-1"},
                "target_link_url": "https://shop.test/"
            }}}
        ]);

        let events = normalize(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EmailEventKind::Bounced);
        assert_eq!(events[0].is_hard_bounce, Some(true));
        assert_eq!(events[1].kind, EmailEventKind::Clicked);
        assert_eq!(events[1].detail.as_deref(), Some("https://shop.test/"));
    }

    #[test]
    fn test_non_array_payload_ignored() {
        assert!(normalize(&serde_json::json!({"msys": {}})).is_empty());
    }
}
