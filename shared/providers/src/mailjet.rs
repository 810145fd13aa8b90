//! Mailjet adapter (v3.1 send API).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use mailtide_models::{EmailProviderKind, MailjetSettings};

use crate::{
    http_client, EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest,
};

const MAILJET_API: &str = "https://api.mailjet.com/v3.1/send";

pub struct MailjetProvider {
    client: reqwest::Client,
    api_key: String,
    secret_key: String,
    sandbox: bool,
}

impl MailjetProvider {
    pub fn new(settings: &MailjetSettings, timeout: Duration) -> ProviderResult<Self> {
        let secret_key = settings
            .secret_key
            .clone()
            .ok_or_else(|| ProviderError::Auth("mailjet secret key not decrypted".to_string()))?;

        Ok(Self {
            client: http_client(timeout)?,
            api_key: settings.api_key.clone(),
            secret_key,
            sandbox: settings.sandbox_mode,
        })
    }
}

#[async_trait]
impl EmailProvider for MailjetProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let mut message = json!({
            "From": {"Email": request.from_address, "Name": request.from_name},
            "To": [{"Email": request.to}],
            "Subject": request.subject,
            "HTMLPart": request.html,
            "CustomID": request.message_id,
        });

        if let Some(text) = &request.options.text {
            message["TextPart"] = json!(text);
        }
        if let Some(reply_to) = &request.options.reply_to {
            message["ReplyTo"] = json!({"Email": reply_to});
        }
        if !request.options.cc.is_empty() {
            message["Cc"] = json!(request
                .options
                .cc
                .iter()
                .map(|email| json!({"Email": email}))
                .collect::<Vec<_>>());
        }
        if !request.options.bcc.is_empty() {
            message["Bcc"] = json!(request
                .options
                .bcc
                .iter()
                .map(|email| json!({"Email": email}))
                .collect::<Vec<_>>());
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
            message["Headers"] = serde_json::Value::Object(headers);
        }

        if !request.options.attachments.is_empty() {
            let engine = base64::engine::general_purpose::STANDARD;
            message["Attachments"] = json!(request
                .options
                .attachments
                .iter()
                .map(|a| json!({
                    "Filename": a.filename,
                    "ContentType": a.content_type,
                    "Base64Content": engine.encode(&a.data),
                }))
                .collect::<Vec<_>>());
        }

        let body = json!({
            "Messages": [message],
            "SandboxMode": self.sandbox,
        });

        let response = self
            .client
            .post(MAILJET_API)
            .basic_auth(&self.api_key, Some(&self.secret_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("mailjet response: {e}")))?;

        let provider_message_id = parsed["Messages"][0]["To"][0]["MessageID"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| {
                parsed["Messages"][0]["To"][0]["MessageUUID"]
                    .as_str()
                    .map(str::to_string)
            });

        Ok(ProviderResponse {
            provider_message_id,
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Mailjet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_secret_is_auth_error() {
        let settings = MailjetSettings {
            api_key: "key".to_string(),
            secret_key: None,
            encrypted_secret_key: Some("deadbeef".to_string()),
            sandbox_mode: false,
        };
        assert!(matches!(
            MailjetProvider::new(&settings, Duration::from_secs(5)),
            Err(ProviderError::Auth(_))
        ));
    }
}
