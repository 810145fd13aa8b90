//! AWS SES adapter (SES v2 API).
//!
//! Simple content for plain sends; messages with attachments go through
//! the raw path using the shared MIME builder. The message id rides along
//! as an email tag so SES event payloads can be mapped back.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sesv2::config::{Credentials, Region};
use aws_sdk_sesv2::error::SdkError;
use aws_sdk_sesv2::operation::send_email::SendEmailError;
use aws_sdk_sesv2::types::{
    Body, Content, Destination, EmailContent, Message, MessageTag, RawMessage,
};
use aws_sdk_sesv2::Client;

use mailtide_models::{EmailProviderKind, SesSettings};

use crate::smtp::build_mime;
use crate::{EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest};

/// Email tag carrying our message id on every SES send.
pub const MESSAGE_ID_TAG: &str = "message_id";

pub struct SesProvider {
    client: Client,
}

fn to_utf8_content(input: &str) -> ProviderResult<Content> {
    Content::builder()
        .data(input)
        .charset("UTF-8")
        .build()
        .map_err(|e| ProviderError::Permanent(format!("content build: {e}")))
}

impl SesProvider {
    pub async fn new(settings: &SesSettings, timeout: Duration) -> ProviderResult<Self> {
        let secret = settings
            .secret_access_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("ses secret key not decrypted".to_string()))?;

        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            secret.to_string(),
            None,
            None,
            "mailtide",
        );

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(timeout)
                    .build(),
            )
            .load()
            .await;

        Ok(Self {
            client: Client::new(&config),
        })
    }
}

#[async_trait]
impl EmailProvider for SesProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let content = if request.options.attachments.is_empty() {
            let body = Body::builder()
                .html(to_utf8_content(&request.html)?)
                .text(to_utf8_content(
                    request.options.text.as_deref().unwrap_or_default(),
                )?)
                .build();

            let message = Message::builder()
                .subject(to_utf8_content(&request.subject)?)
                .body(body)
                .build();

            EmailContent::builder().simple(message).build()
        } else {
            let mime = build_mime(request)?;
            let raw = RawMessage::builder()
                .data(aws_sdk_sesv2::primitives::Blob::new(mime.formatted()))
                .build()
                .map_err(|e| ProviderError::Permanent(format!("raw message: {e}")))?;
            EmailContent::builder().raw(raw).build()
        };

        let destination = Destination::builder()
            .to_addresses(&request.to)
            .set_cc_addresses(
                (!request.options.cc.is_empty()).then(|| request.options.cc.clone()),
            )
            .set_bcc_addresses(
                (!request.options.bcc.is_empty()).then(|| request.options.bcc.clone()),
            )
            .build();

        let tag = MessageTag::builder()
            .name(MESSAGE_ID_TAG)
            .value(&request.message_id)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("message tag: {e}")))?;

        let mut op = self
            .client
            .send_email()
            .from_email_address(format!("{} <{}>", request.from_name, request.from_address))
            .destination(destination)
            .email_tags(tag)
            .content(content);

        if let Some(reply_to) = &request.options.reply_to {
            op = op.reply_to_addresses(reply_to);
        }

        let output = op.send().await.map_err(classify_sdk_error)?;

        Ok(ProviderResponse {
            provider_message_id: output.message_id().map(str::to_string),
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Ses
    }
}

fn classify_sdk_error(
    error: SdkError<SendEmailError, aws_sdk_sesv2::config::http::HttpResponse>,
) -> ProviderError {
    let text = format!("{error:?}");
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ProviderError::Transient(text),
        SdkError::ServiceError(service) => match service.err() {
            SendEmailError::TooManyRequestsException(_)
            | SendEmailError::LimitExceededException(_) => ProviderError::RateLimited {
                retry_after_secs: None,
            },
            SendEmailError::AccountSuspendedException(_) => ProviderError::Auth(text),
            SendEmailError::BadRequestException(_)
            | SendEmailError::MailFromDomainNotVerifiedException(_)
            | SendEmailError::MessageRejected(_)
            | SendEmailError::NotFoundException(_)
            | SendEmailError::SendingPausedException(_) => ProviderError::Permanent(text),
            _ => ProviderError::Transient(text),
        },
        _ => ProviderError::Transient(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_builder_accepts_utf8() {
        assert!(to_utf8_content("héllo ✉").is_ok());
    }
}
