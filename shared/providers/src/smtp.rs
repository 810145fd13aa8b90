//! SMTP adapter.
//!
//! Builds an RFC 5322 multipart/alternative message with lettre and hands
//! it to an async SMTP transport. Supports PLAIN/LOGIN credentials and
//! XOAUTH2 (Microsoft tenant or Google refresh-token flows). When a bounce
//! address is configured it becomes the envelope sender, so DSNs land in
//! the bounce mailbox the feedback poller watches.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment as LettreAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use mailtide_models::{EmailProviderKind, SmtpSettings};

use crate::oauth;
use crate::{EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest};

#[derive(Debug, Clone)]
pub struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ListUnsubscribePost(String);

impl Header for ListUnsubscribePost {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

pub struct SmtpProvider {
    settings: SmtpSettings,
    timeout: Duration,
}

impl SmtpProvider {
    pub fn new(settings: SmtpSettings, timeout: Duration) -> ProviderResult<Self> {
        Ok(Self { settings, timeout })
    }

    async fn transport(&self) -> ProviderResult<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = if self.settings.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.host)
                .map_err(|e| ProviderError::Permanent(format!("smtp transport: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.settings.host)
        };

        let builder = builder
            .port(self.settings.port)
            .timeout(Some(self.timeout));

        let builder = match &self.settings.oauth {
            Some(oauth_settings) => {
                let access_token = oauth::fetch_access_token(oauth_settings).await?;
                builder
                    .credentials(Credentials::new(
                        self.settings.username.clone(),
                        access_token,
                    ))
                    .authentication(vec![Mechanism::Xoauth2])
            }
            None => {
                let password = self.settings.password.clone().ok_or_else(|| {
                    ProviderError::Auth("smtp password not decrypted".to_string())
                })?;
                builder.credentials(Credentials::new(
                    self.settings.username.clone(),
                    password,
                ))
            }
        };

        Ok(builder.build())
    }
}

/// Build the outbound MIME message shared by the SMTP and SES-raw paths.
pub fn build_mime(request: &SendEmailRequest) -> ProviderResult<Message> {
    let from: Mailbox = format!("{} <{}>", request.from_name, request.from_address)
        .parse()
        .map_err(|e| ProviderError::Permanent(format!("invalid from address: {e}")))?;
    let to: Mailbox = request
        .to
        .parse()
        .map_err(|e| ProviderError::Permanent(format!("invalid recipient: {e}")))?;

    // The wire Message-ID carries our message id, so DSNs referencing the
    // original message resolve straight back to the history row.
    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(&request.subject)
        .message_id(Some(format!("{}@mailtide", request.message_id)));

    if let Some(reply_to) = &request.options.reply_to {
        let mailbox: Mailbox = reply_to
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("invalid reply-to: {e}")))?;
        builder = builder.reply_to(mailbox);
    }
    for cc in &request.options.cc {
        let mailbox: Mailbox = cc
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("invalid cc address: {e}")))?;
        builder = builder.cc(mailbox);
    }
    for bcc in &request.options.bcc {
        let mailbox: Mailbox = bcc
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("invalid bcc address: {e}")))?;
        builder = builder.bcc(mailbox);
    }

    match (
        &request.options.list_unsubscribe_url,
        &request.options.list_unsubscribe_mailto,
    ) {
        (Some(url), Some(mailto)) => {
            builder = builder
                .header(ListUnsubscribe(format!("<mailto:{mailto}>, <{url}>")))
                .header(ListUnsubscribePost("List-Unsubscribe=One-Click".to_string()));
        }
        (Some(url), None) => {
            builder = builder
                .header(ListUnsubscribe(format!("<{url}>")))
                .header(ListUnsubscribePost("List-Unsubscribe=One-Click".to_string()));
        }
        (None, Some(mailto)) => {
            builder = builder.header(ListUnsubscribe(format!("<mailto:{mailto}>")));
        }
        (None, None) => {}
    }

    let text = request
        .options
        .text
        .clone()
        .unwrap_or_else(|| html_to_text_fallback(&request.html));

    let alternative = MultiPart::alternative()
        .singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text),
        )
        .singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(request.html.clone()),
        );

    let message = if request.options.attachments.is_empty() {
        builder.multipart(alternative)
    } else {
        let mut mixed = MultiPart::mixed().multipart(alternative);
        for attachment in &request.options.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or(ContentType::parse("application/octet-stream").unwrap());
            mixed = mixed.singlepart(
                LettreAttachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    message.map_err(|e| ProviderError::Permanent(format!("message build failed: {e}")))
}

/// Crude plaintext rendition for the multipart/alternative text part when
/// the caller supplied none.
fn html_to_text_fallback(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let message = build_mime(request)?;
        let transport = self.transport().await?;

        // Return-Path: a configured bounce address overrides the envelope
        // sender so DSNs route to the polled mailbox.
        let envelope_from = self
            .settings
            .bounce_address
            .as_deref()
            .unwrap_or(&request.from_address);
        let from = envelope_from
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("invalid bounce address: {e}")))?;
        let mut recipients = vec![request
            .to
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("invalid recipient: {e}")))?];
        for address in request.options.cc.iter().chain(&request.options.bcc) {
            recipients.push(
                address
                    .parse()
                    .map_err(|e| ProviderError::Permanent(format!("invalid recipient: {e}")))?,
            );
        }
        let envelope = Envelope::new(Some(from), recipients)
            .map_err(|e| ProviderError::Permanent(format!("envelope: {e}")))?;

        let response = transport
            .send_raw(&envelope, &message.formatted())
            .await
            .map_err(classify_smtp_error)?;

        let provider_message_id = response.message().next().map(str::to_string);

        Ok(ProviderResponse {
            provider_message_id,
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Smtp
    }
}

fn classify_smtp_error(error: lettre::transport::smtp::Error) -> ProviderError {
    if error.is_permanent() {
        ProviderError::Permanent(error.to_string())
    } else if error.is_client() {
        ProviderError::Auth(error.to_string())
    } else {
        ProviderError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SendEmailOptions;

    fn request() -> SendEmailRequest {
        SendEmailRequest {
            workspace_id: "acme".to_string(),
            integration_id: "int-1".to_string(),
            message_id: "m-1".to_string(),
            from_address: "noreply@acme.test".to_string(),
            from_name: "Acme".to_string(),
            to: "a@b.test".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hello <b>there</b></p>".to_string(),
            options: SendEmailOptions {
                list_unsubscribe_url: Some("https://t.acme.test/u".to_string()),
                list_unsubscribe_mailto: Some("unsub@acme.test".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_build_mime_headers() {
        let message = build_mime(&request()).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("Subject: Hello"));
        assert!(formatted.contains("m-1@mailtide"));
        assert!(formatted.contains("List-Unsubscribe: <mailto:unsub@acme.test>, <https://t.acme.test/u>"));
        assert!(formatted.contains("List-Unsubscribe-Post: List-Unsubscribe=One-Click"));
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("text/plain"));
        assert!(formatted.contains("text/html"));
    }

    #[test]
    fn test_invalid_addresses_are_permanent() {
        let mut bad = request();
        bad.to = "not an address".to_string();
        assert!(matches!(
            build_mime(&bad),
            Err(ProviderError::Permanent(_))
        ));
    }

    #[test]
    fn test_html_to_text_fallback() {
        assert_eq!(
            html_to_text_fallback("<p>Hello <b>there</b></p>"),
            "Hello there"
        );
    }
}
