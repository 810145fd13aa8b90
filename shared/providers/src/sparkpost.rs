//! SparkPost adapter (transmissions API).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use mailtide_models::{EmailProviderKind, SparkPostSettings};

use crate::{
    http_client, EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest,
};

pub struct SparkPostProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    sandbox: bool,
}

impl SparkPostProvider {
    pub fn new(settings: &SparkPostSettings, timeout: Duration) -> ProviderResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Auth("sparkpost api key not decrypted".to_string()))?;

        Ok(Self {
            client: http_client(timeout)?,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            api_key,
            sandbox: settings.sandbox_mode,
        })
    }
}

#[async_trait]
impl EmailProvider for SparkPostProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let mut content = json!({
            "from": {
                "email": request.from_address,
                "name": request.from_name,
            },
            "subject": request.subject,
            "html": request.html,
        });
        if let Some(text) = &request.options.text {
            content["text"] = json!(text);
        }
        if let Some(reply_to) = &request.options.reply_to {
            content["reply_to"] = json!(reply_to);
        }
        if !request.options.attachments.is_empty() {
            let engine = base64::engine::general_purpose::STANDARD;
            content["attachments"] = json!(request
                .options
                .attachments
                .iter()
                .map(|a| json!({
                    "name": a.filename,
                    "type": a.content_type,
                    "data": engine.encode(&a.data),
                }))
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
            content["headers"] = serde_json::Value::Object(headers);
        }

        let recipients: Vec<serde_json::Value> = std::iter::once(&request.to)
            .chain(request.options.cc.iter())
            .chain(request.options.bcc.iter())
            .map(|address| {
                json!({
                    "address": {"email": address},
                    "metadata": {"message_id": request.message_id},
                })
            })
            .collect();

        let body = json!({
            "options": {"sandbox": self.sandbox, "transactional": true},
            "content": content,
            "recipients": recipients,
            "metadata": {"message_id": request.message_id},
        });

        let response = self
            .client
            .post(format!("{}/api/v1/transmissions", self.endpoint))
            .header("Authorization", &self.api_key)
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
            .map_err(|e| ProviderError::Transient(format!("sparkpost response: {e}")))?;

        Ok(ProviderResponse {
            provider_message_id: parsed["results"]["id"].as_str().map(str::to_string),
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Sparkpost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_auth_error() {
        let settings = SparkPostSettings {
            endpoint: "https://api.sparkpost.com".to_string(),
            api_key: None,
            encrypted_api_key: Some("deadbeef".to_string()),
            sandbox_mode: false,
        };
        assert!(matches!(
            SparkPostProvider::new(&settings, Duration::from_secs(5)),
            Err(ProviderError::Auth(_))
        ));
    }
}
