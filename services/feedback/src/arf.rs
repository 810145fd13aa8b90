//! Abuse Reporting Format (RFC 5965) parsing.
//!
//! The `message/feedback-report` part carries the report fields; the
//! attached original message supplies the Message-Id and a recipient
//! fallback. Non-complaint feedback types (auth-failure and friends) are
//! returned as-is for the caller to classify.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};

use crate::dsn::normalize_message_id;

#[derive(Debug, Clone, PartialEq)]
pub struct ArfReport {
    pub feedback_type: String,
    pub recipient: Option<String>,
    pub original_message_id: Option<String>,
    pub user_agent: Option<String>,
    pub source_ip: Option<String>,
    pub reported_domain: Option<String>,
    pub arrival_date: Option<DateTime<Utc>>,
}

impl ArfReport {
    /// Abuse/fraud/virus reports are complaints; auth-failure and opt-out
    /// variants are not.
    pub fn is_complaint(&self) -> bool {
        matches!(self.feedback_type.as_str(), "abuse" | "fraud" | "virus")
    }
}

/// Parse a raw message as an ARF report; None when it carries no
/// feedback-report part.
pub fn parse_arf(raw: &[u8]) -> Option<ArfReport> {
    let message = MessageParser::default().parse(raw)?;

    let mut report_fields: Option<String> = None;
    let mut original_message_id: Option<String> = None;
    let mut recipient_fallback: Option<String> = None;

    for part in &message.parts {
        let Some(content_type) = part.content_type() else {
            continue;
        };
        let ctype = content_type.ctype().to_ascii_lowercase();
        let subtype = content_type
            .subtype()
            .unwrap_or("")
            .to_ascii_lowercase();

        match (ctype.as_str(), subtype.as_str()) {
            ("message", "feedback-report") => {
                report_fields = Some(part_text(part));
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
            _ => {}
        }
    }

    let fields = report_fields?;
    let feedback_type = field_value(&fields, "Feedback-Type")?;

    let recipient = field_value(&fields, "Original-Rcpt-To")
        .map(|v| strip_address_type(&v))
        .or(recipient_fallback);

    Some(ArfReport {
        feedback_type: feedback_type.to_ascii_lowercase(),
        recipient,
        original_message_id: original_message_id.map(normalize_message_id),
        user_agent: field_value(&fields, "User-Agent"),
        source_ip: field_value(&fields, "Source-IP"),
        reported_domain: field_value(&fields, "Reported-Domain"),
        arrival_date: field_value(&fields, "Arrival-Date")
            .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

fn part_text(part: &mail_parser::MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) => text.to_string(),
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            String::from_utf8_lossy(data).into_owned()
        }
        _ => String::new(),
    }
}

fn field_value(text: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .map(|line| line[name.len() + 1..].trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_address_type(value: &str) -> String {
    match value.split_once(';') {
        Some((_, address)) => address.trim().to_string(),
        None => value.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(feedback_type: &str) -> String {
        let boundary = "arf-boundary";
        format!(
            "From: abuse-desk@isp.test\r\n\
             To: bounces@mailtide.test\r\n\
             Subject: Abuse report\r\n\
             Content-Type: multipart/report; report-type=feedback-report; boundary=\"{boundary}\"\r\n\
             MIME-Version: 1.0\r\n\r\n\
             --{boundary}\r\n\
             Content-Type: text/plain\r\n\r\n\
             This is an abuse report.\r\n\r\n\
             --{boundary}\r\n\
             Content-Type: message/feedback-report\r\n\r\n\
             Feedback-Type: {feedback_type}\r\n\
             User-Agent: SomeGenerator/1.0\r\n\
             Version: 1\r\n\
             Original-Rcpt-To: rfc822; x@y.test\r\n\
             Source-IP: 192.0.2.1\r\n\
             Reported-Domain: acme.test\r\n\r\n\
             --{boundary}\r\n\
             Content-Type: message/rfc822\r\n\r\n\
             Message-ID: <m-1@mailtide>\r\n\
             To: <x@y.test>\r\n\
             Subject: original\r\n\r\n\
             body\r\n\
             --{boundary}--\r\n"
        )
    }

    #[test]
    fn test_parse_abuse_report() {
        let report = parse_arf(sample("abuse").as_bytes()).unwrap();
        assert_eq!(report.feedback_type, "abuse");
        assert!(report.is_complaint());
        assert_eq!(report.recipient.as_deref(), Some("x@y.test"));
        assert_eq!(report.original_message_id.as_deref(), Some("m-1"));
        assert_eq!(report.source_ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(report.reported_domain.as_deref(), Some("acme.test"));
        assert_eq!(report.user_agent.as_deref(), Some("SomeGenerator/1.0"));
    }

    #[test]
    fn test_auth_failure_is_not_complaint() {
        let report = parse_arf(sample("auth-failure").as_bytes()).unwrap();
        assert_eq!(report.feedback_type, "auth-failure");
        assert!(!report.is_complaint());
    }

    #[test]
    fn test_plain_message_is_not_arf() {
        let plain = b"From: a@b.test\r\nSubject: hi\r\n\r\nhello";
        assert!(parse_arf(plain).is_none());
    }
}
