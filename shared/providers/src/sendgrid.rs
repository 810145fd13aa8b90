//! SendGrid adapter (v3 mail send API).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use mailtide_models::{EmailProviderKind, SendGridSettings};

use crate::{
    http_client, EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest,
};

const SENDGRID_API: &str = "https://api.sendgrid.com/v3/mail/send";

pub struct SendGridProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SendGridProvider {
    pub fn new(settings: &SendGridSettings, timeout: Duration) -> ProviderResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Auth("sendgrid api key not decrypted".to_string()))?;

        Ok(Self {
            client: http_client(timeout)?,
            api_key,
        })
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let mut personalization = json!({
            "to": [{"email": request.to}],
            "custom_args": {"message_id": request.message_id},
        });
        if !request.options.cc.is_empty() {
            personalization["cc"] = json!(request
                .options
                .cc
                .iter()
                .map(|email| json!({"email": email}))
                .collect::<Vec<_>>());
        }
        if !request.options.bcc.is_empty() {
            personalization["bcc"] = json!(request
                .options
                .bcc
                .iter()
                .map(|email| json!({"email": email}))
                .collect::<Vec<_>>());
        }

        let mut content = Vec::new();
        if let Some(text) = &request.options.text {
            content.push(json!({"type": "text/plain", "value": text}));
        }
        content.push(json!({"type": "text/html", "value": request.html}));

        let mut body = json!({
            "personalizations": [personalization],
            "from": {"email": request.from_address, "name": request.from_name},
            "subject": request.subject,
            "content": content,
        });

        if let Some(reply_to) = &request.options.reply_to {
            body["reply_to"] = json!({"email": reply_to});
        }

        let mut headers = serde_json::Map::new();
        if let Some(url) = &request.options.list_unsubscribe_url {
            headers.insert("List-Unsubscribe".to_string(), json!(format!("<{url}>")));
            headers.insert(
                "List-Unsubscribe-Post".to_string(),
                json!("List-Unsubscribe=One-Click"),
            );
        }
        if !headers.is_empty() {
            body["headers"] = serde_json::Value::Object(headers);
        }

        if !request.options.attachments.is_empty() {
            let engine = base64::engine::general_purpose::STANDARD;
            body["attachments"] = json!(request
                .options
                .attachments
                .iter()
                .map(|a| json!({
                    "filename": a.filename,
                    "type": a.content_type,
                    "content": engine.encode(&a.data),
                }))
                .collect::<Vec<_>>());
        }

        let response = self
            .client
            .post(SENDGRID_API)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        // SendGrid answers 202 with the id in a header and no body.
        let provider_message_id = response
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(ProviderResponse {
            provider_message_id,
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Sendgrid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_auth_error() {
        let settings = SendGridSettings {
            api_key: None,
            encrypted_api_key: Some("deadbeef".to_string()),
        };
        assert!(matches!(
            SendGridProvider::new(&settings, Duration::from_secs(5)),
            Err(ProviderError::Auth(_))
        ));
    }
}
