//! Heuristic bounce/complaint detection.
//!
//! Fallback for mailer-daemon messages whose MIME structure is malformed
//! or missing the delivery-status part: match well-known bounce phrases,
//! regex-extract the first address after the matching line, and map
//! permanent-sounding phrases to 5.0.0, temporary-sounding ones to 4.0.0.

use std::sync::OnceLock;

use mail_parser::{Message, MessageParser};
use regex::Regex;

use crate::dsn::{normalize_message_id, DsnReport};

const HARD_PHRASES: &[&str] = &[
    "user unknown",
    "no such user",
    "does not exist",
    "address rejected",
    "invalid recipient",
    "unknown recipient",
    "mailbox unavailable",
    "recipient address rejected",
    "account disabled",
    "delivery permanently failed",
];

const SOFT_PHRASES: &[&str] = &[
    "mailbox full",
    "over quota",
    "quota exceeded",
    "temporarily",
    "temporary failure",
    "try again later",
    "delivery delayed",
    "deferred",
];

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+").unwrap()
    })
}

/// Does this look like a mailer-daemon notification at all?
pub fn is_bounce_candidate(message: &Message<'_>) -> bool {
    let from_daemon = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| addr.address())
        .map(|address| {
            let lower = address.to_ascii_lowercase();
            lower.starts_with("mailer-daemon") || lower.starts_with("postmaster")
        })
        .unwrap_or(false);

    let subject_hit = message
        .subject()
        .map(|subject| {
            let lower = subject.to_ascii_lowercase();
            lower.contains("undeliver")
                || lower.contains("returned mail")
                || lower.contains("delivery status")
                || lower.contains("failure notice")
                || lower.contains("delivery failed")
        })
        .unwrap_or(false);

    from_daemon || subject_hit
}

/// Heuristic DSN extraction from a malformed bounce. None when the message
/// does not look like a bounce.
pub fn heuristic_bounce(raw: &[u8]) -> Option<DsnReport> {
    let message = MessageParser::default().parse(raw)?;
    if !is_bounce_candidate(&message) {
        return None;
    }

    let body = message.body_text(0).map(|t| t.into_owned()).unwrap_or_default();
    let lower = body.to_ascii_lowercase();

    let hard = HARD_PHRASES.iter().any(|phrase| lower.contains(phrase));
    let soft = SOFT_PHRASES.iter().any(|phrase| lower.contains(phrase));
    if !hard && !soft {
        return None;
    }

    // The first address after the matching phrase line; falls back to the
    // first address anywhere in the body.
    let phrase_offset = HARD_PHRASES
        .iter()
        .chain(SOFT_PHRASES.iter())
        .filter_map(|phrase| lower.find(phrase))
        .min()
        .unwrap_or(0);
    let recipient = address_regex()
        .find(&body[phrase_offset..])
        .or_else(|| address_regex().find(&body))
        .map(|m| m.as_str().to_string());

    let original_message_id = extract_embedded_message_id(&body);

    Some(DsnReport {
        recipient,
        original_message_id,
        status_code: Some(if hard { "5.0.0" } else { "4.0.0" }.to_string()),
        diagnostic: first_phrase_line(&body, &lower),
        is_hard_bounce: hard,
        arrival_date: message.date().map(|d| {
            chrono::DateTime::from_timestamp(d.to_timestamp(), 0).unwrap_or_else(chrono::Utc::now)
        }),
    })
}

/// Complaint heuristics: an X-Complaints-To header or a complaint-sounding
/// subject.
pub fn is_complaint_candidate(raw: &[u8]) -> bool {
    let Some(message) = MessageParser::default().parse(raw) else {
        return false;
    };

    let has_complaints_header = message
        .headers()
        .iter()
        .any(|h| h.name.as_str().eq_ignore_ascii_case("X-Complaints-To"));

    let subject_hit = message
        .subject()
        .map(|subject| {
            let lower = subject.to_ascii_lowercase();
            lower.contains("complaint") || lower.contains("abuse report") || lower.contains("spam report")
        })
        .unwrap_or(false);

    has_complaints_header || subject_hit
}

fn extract_embedded_message_id(body: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?im)^message-id:\s*(<[^>]+>|\S+)").unwrap());
    re.captures(body)
        .map(|caps| normalize_message_id(caps[1].to_string()))
}

fn first_phrase_line(body: &str, lower: &str) -> Option<String> {
    for phrase in HARD_PHRASES.iter().chain(SOFT_PHRASES.iter()) {
        if let Some(offset) = lower.find(phrase) {
            let start = body[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
            let end = body[offset..]
                .find('\n')
                .map(|i| offset + i)
                .unwrap_or(body.len());
            return Some(body[start..end].trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounce(body: &str) -> String {
        format!(
            "From: Mail Delivery System <MAILER-DAEMON@mx.test>\r\n\
             To: bounces@mailtide.test\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\r\n\
             {body}"
        )
    }

    #[test]
    fn test_hard_phrase_maps_to_500() {
        let raw = bounce("The following address failed:\r\n\r\nx@y.test: user unknown\r\nMessage-Id: <m-1@mailtide>\r\n");
        let report = heuristic_bounce(raw.as_bytes()).unwrap();
        assert_eq!(report.status_code.as_deref(), Some("5.0.0"));
        assert!(report.is_hard_bounce);
        assert_eq!(report.recipient.as_deref(), Some("x@y.test"));
        assert_eq!(report.original_message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_soft_phrase_maps_to_400() {
        let raw = bounce("Delivery to x@y.test deferred: mailbox full, try again later\r\n");
        let report = heuristic_bounce(raw.as_bytes()).unwrap();
        assert_eq!(report.status_code.as_deref(), Some("4.0.0"));
        assert!(!report.is_hard_bounce);
    }

    #[test]
    fn test_regular_mail_is_not_a_bounce() {
        let raw = "From: friend@example.test\r\nSubject: lunch?\r\n\r\nuser unknown to me\r\n";
        assert!(heuristic_bounce(raw.as_bytes()).is_none());
    }

    #[test]
    fn test_bounce_without_known_phrase_is_skipped() {
        let raw = bounce("something odd happened\r\n");
        assert!(heuristic_bounce(raw.as_bytes()).is_none());
    }

    #[test]
    fn test_complaint_detection() {
        let with_header = "From: a@b.test\r\nX-Complaints-To: abuse@isp.test\r\nSubject: fwd\r\n\r\nx";
        assert!(is_complaint_candidate(with_header.as_bytes()));

        let by_subject = "From: a@b.test\r\nSubject: Spam report for your mail\r\n\r\nx";
        assert!(is_complaint_candidate(by_subject.as_bytes()));

        let plain = "From: a@b.test\r\nSubject: hello\r\n\r\nx";
        assert!(!is_complaint_candidate(plain.as_bytes()));
    }
}
