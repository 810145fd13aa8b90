//! Delivery Status Notification (RFC 3464) parsing.
//!
//! Walks a multipart/report message: the `message/delivery-status` part
//! yields Final-Recipient, Status (RFC 3463 x.y.z) and Diagnostic-Code
//! (with folded continuation lines merged); the attached original message
//! (message/rfc822 or text/rfc822-headers) yields the original
//! Message-Id. A status starting `5.` is a hard bounce.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};

#[derive(Debug, Clone, PartialEq)]
pub struct DsnReport {
    pub recipient: Option<String>,
    pub original_message_id: Option<String>,
    pub status_code: Option<String>,
    pub diagnostic: Option<String>,
    pub is_hard_bounce: bool,
    pub arrival_date: Option<DateTime<Utc>>,
}

impl DsnReport {
    pub fn classify(status: Option<&str>) -> bool {
        status.map(|s| s.starts_with("5.")).unwrap_or(false)
    }
}

/// Parse a raw RFC 822 message as a DSN. Returns None when it has no
/// delivery-status part at all (callers fall back to heuristics).
pub fn parse_dsn(raw: &[u8]) -> Option<DsnReport> {
    let message = MessageParser::default().parse(raw)?;

    let mut status_fields: Option<String> = None;
    let mut original_message_id: Option<String> = None;
    let mut recipient_fallback: Option<String> = None;

    for part in &message.parts {
        let content_type = part.content_type();
        let (ctype, subtype) = match content_type {
            Some(ct) => (
                ct.ctype().to_ascii_lowercase(),
                ct.subtype().unwrap_or("").to_ascii_lowercase(),
            ),
            None => continue,
        };

        match (ctype.as_str(), subtype.as_str()) {
            ("message", "delivery-status") => {
                status_fields = Some(part_text(part));
            }
            ("message", "rfc822") => {
                if let PartType::Message(nested) = &part.body {
                    original_message_id = nested
                        .message_id()
                        .map(str::to_string)
                        .or(original_message_id);
                    recipient_fallback = nested
                        .to()
                        .and_then(|to| to.first())
                        .and_then(|addr| addr.address())
                        .map(str::to_string)
                        .or(recipient_fallback);
                }
            }
            ("text", "rfc822-headers") => {
                let text = part_text(part);
                original_message_id =
                    header_value(&text, "Message-Id").or(original_message_id);
            }
            _ => {}
        }
    }

    let fields = status_fields?;
    let unfolded = unfold(&fields);

    let recipient = field_value(&unfolded, "Final-Recipient")
        .map(|v| strip_address_type(&v))
        .or(recipient_fallback);
    let status_code = field_value(&unfolded, "Status");
    let diagnostic = field_value(&unfolded, "Diagnostic-Code");
    let arrival_date = field_value(&unfolded, "Arrival-Date")
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(DsnReport {
        recipient,
        original_message_id: original_message_id.map(normalize_message_id),
        is_hard_bounce: DsnReport::classify(status_code.as_deref()),
        status_code,
        diagnostic,
        arrival_date,
    })
}

/// Render a DSN back into a minimal multipart/report message. Used by
/// tests and fixtures; `parse_dsn` inverts it on the normalized fields.
pub fn serialize_dsn(report: &DsnReport) -> String {
    let boundary = "mailtide-dsn-boundary";
    let mut out = String::new();

    out.push_str("From: MAILER-DAEMON <mailer-daemon@mx.test>\r\n");
    out.push_str("To: bounces@mailtide.test\r\n");
    out.push_str("Subject: Undelivered Mail Returned to Sender\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/report; report-type=delivery-status; boundary=\"{boundary}\"\r\n",
    ));
    out.push_str("MIME-Version: 1.0\r\n\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: text/plain\r\n\r\n");
    out.push_str("Delivery to the following recipient failed.\r\n\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: message/delivery-status\r\n\r\n");
    out.push_str("Reporting-MTA: dns; mx.test\r\n");
    if let Some(arrival) = report.arrival_date {
        out.push_str(&format!("Arrival-Date: {}\r\n", arrival.to_rfc2822()));
    }
    out.push_str("\r\n");
    if let Some(recipient) = &report.recipient {
        out.push_str(&format!("Final-Recipient: rfc822; {recipient}\r\n"));
    }
    out.push_str("Action: failed\r\n");
    if let Some(status) = &report.status_code {
        out.push_str(&format!("Status: {status}\r\n"));
    }
    if let Some(diagnostic) = &report.diagnostic {
        out.push_str(&format!("Diagnostic-Code: {diagnostic}\r\n"));
    }
    out.push_str("\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: message/rfc822\r\n\r\n");
    if let Some(message_id) = &report.original_message_id {
        out.push_str(&format!("Message-ID: <{message_id}>\r\n"));
    }
    if let Some(recipient) = &report.recipient {
        out.push_str(&format!("To: <{recipient}>\r\n"));
    }
    out.push_str("Subject: original message\r\n\r\nbody\r\n");

    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

fn part_text(part: &mail_parser::MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) => text.to_string(),
        PartType::Html(text) => text.to_string(),
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            String::from_utf8_lossy(data).into_owned()
        }
        _ => String::new(),
    }
}

/// Merge folded continuation lines (leading whitespace) into their field.
fn unfold(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(line.trim_start());
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

/// First value of a per-recipient field in unfolded delivery-status text.
fn field_value(text: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .map(|line| line[name.len() + 1..].trim().to_string())
        .filter(|v| !v.is_empty())
}

fn header_value(text: &str, name: &str) -> Option<String> {
    field_value(&unfold(text), name).map(|v| v.trim_matches(['<', '>']).to_string())
}

/// Drop the "rfc822;" address-type prefix of Final-Recipient values.
fn strip_address_type(value: &str) -> String {
    match value.split_once(';') {
        Some((_, address)) => address.trim().to_string(),
        None => value.trim().to_string(),
    }
}

/// Strip angle brackets and our domain suffix so the wire Message-ID folds
/// back to the queue message id.
pub fn normalize_message_id(value: String) -> String {
    let trimmed = value.trim().trim_matches(['<', '>']);
    match trimmed.split_once('@') {
        Some((local, _)) => local.to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: &str) -> String {
        serialize_dsn(&DsnReport {
            recipient: Some("x@y.test".to_string()),
            original_message_id: Some("m-1@mailtide".to_string()),
            status_code: Some(status.to_string()),
            diagnostic: Some("smtp; 550 5.1.1 user unknown".to_string()),
            is_hard_bounce: status.starts_with("5."),
            arrival_date: None,
        })
    }

    #[test]
    fn test_parse_hard_bounce() {
        let report = parse_dsn(sample("5.1.1").as_bytes()).unwrap();
        assert_eq!(report.recipient.as_deref(), Some("x@y.test"));
        assert_eq!(report.original_message_id.as_deref(), Some("m-1"));
        assert_eq!(report.status_code.as_deref(), Some("5.1.1"));
        assert!(report.is_hard_bounce);
        assert!(report.diagnostic.as_deref().unwrap().contains("550"));
    }

    #[test]
    fn test_parse_soft_bounce() {
        let report = parse_dsn(sample("4.2.2").as_bytes()).unwrap();
        assert!(!report.is_hard_bounce);
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let original = DsnReport {
            recipient: Some("someone@example.test".to_string()),
            original_message_id: Some("m-42".to_string()),
            status_code: Some("5.2.2".to_string()),
            diagnostic: Some("smtp; 552 mailbox over quota".to_string()),
            is_hard_bounce: true,
            arrival_date: None,
        };

        let parsed = parse_dsn(serialize_dsn(&original).as_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_folded_diagnostic_is_merged() {
        let mut raw = sample("5.1.1");
        raw = raw.replace(
            "Diagnostic-Code: smtp; 550 5.1.1 user unknown\r\n",
            "Diagnostic-Code: smtp; 550 5.1.1\r\n\tuser unknown at this host\r\n",
        );
        let report = parse_dsn(raw.as_bytes()).unwrap();
        assert_eq!(
            report.diagnostic.as_deref(),
            Some("smtp; 550 5.1.1 user unknown at this host")
        );
    }

    #[test]
    fn test_non_dsn_returns_none() {
        let plain = b"From: a@b.test\r\nTo: c@d.test\r\nSubject: hi\r\n\r\nhello";
        assert!(parse_dsn(plain).is_none());
    }

    #[test]
    fn test_status_classification_boundary() {
        assert!(DsnReport::classify(Some("5.0.0")));
        assert!(!DsnReport::classify(Some("4.0.0")));
        assert!(!DsnReport::classify(Some("2.0.0")));
        assert!(!DsnReport::classify(None));
    }
}
