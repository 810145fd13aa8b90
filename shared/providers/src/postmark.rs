//! Postmark adapter.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use mailtide_models::{EmailProviderKind, PostmarkSettings};

use crate::{
    http_client, EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest,
};

const POSTMARK_API: &str = "https://api.postmarkapp.com";

pub struct PostmarkProvider {
    client: reqwest::Client,
    server_token: String,
}

impl PostmarkProvider {
    pub fn new(settings: &PostmarkSettings, timeout: Duration) -> ProviderResult<Self> {
        let server_token = settings
            .server_token
            .clone()
            .ok_or_else(|| ProviderError::Auth("postmark server token not decrypted".to_string()))?;

        Ok(Self {
            client: http_client(timeout)?,
            server_token,
        })
    }
}

#[async_trait]
impl EmailProvider for PostmarkProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let mut body = json!({
            "From": format!("{} <{}>", request.from_name, request.from_address),
            "To": request.to,
            "Subject": request.subject,
            "HtmlBody": request.html,
            "MessageStream": "outbound",
            "Metadata": {"message_id": request.message_id},
        });

        if let Some(text) = &request.options.text {
            body["TextBody"] = json!(text);
        }
        if let Some(reply_to) = &request.options.reply_to {
            body["ReplyTo"] = json!(reply_to);
        }
        if !request.options.cc.is_empty() {
            body["Cc"] = json!(request.options.cc.join(","));
        }
        if !request.options.bcc.is_empty() {
            body["Bcc"] = json!(request.options.bcc.join(","));
        }

        let mut headers = Vec::new();
        if let Some(url) = &request.options.list_unsubscribe_url {
            headers.push(json!({"Name": "List-Unsubscribe", "Value": format!("<{url}>")}));
            headers.push(json!({
                "Name": "List-Unsubscribe-Post",
                "Value": "List-Unsubscribe=One-Click",
            }));
        }
        if !headers.is_empty() {
            body["Headers"] = json!(headers);
        }

        if !request.options.attachments.is_empty() {
            let engine = base64::engine::general_purpose::STANDARD;
            body["Attachments"] = json!(request
                .options
                .attachments
                .iter()
                .map(|a| json!({
                    "Name": a.filename,
                    "ContentType": a.content_type,
                    "Content": engine.encode(&a.data),
                }))
                .collect::<Vec<_>>());
        }

        let response = self
            .client
            .post(format!("{POSTMARK_API}/email"))
            .header("X-Postmark-Server-Token", &self.server_token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            // Postmark reports auth problems with 401 and per-message
            // rejections as 422 with an ErrorCode.
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("postmark response: {e}")))?;

        Ok(ProviderResponse {
            provider_message_id: parsed["MessageID"].as_str().map(str::to_string),
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Postmark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_token_is_auth_error() {
        let settings = PostmarkSettings {
            server_token: None,
            encrypted_server_token: Some("deadbeef".to_string()),
        };
        assert!(matches!(
            PostmarkProvider::new(&settings, Duration::from_secs(5)),
            Err(ProviderError::Auth(_))
        ));
    }
}
