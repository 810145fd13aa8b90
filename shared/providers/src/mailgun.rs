//! Mailgun adapter (messages API, form-encoded).

use std::time::Duration;

use async_trait::async_trait;

use mailtide_models::{EmailProviderKind, MailgunSettings};

use crate::{
    http_client, EmailProvider, ProviderError, ProviderResponse, ProviderResult, SendEmailRequest,
};

pub struct MailgunProvider {
    client: reqwest::Client,
    domain: String,
    api_base: String,
    api_key: String,
}

fn api_base_for_region(region: &str) -> &'static str {
    match region {
        "eu" => "https://api.eu.mailgun.net",
        _ => "https://api.mailgun.net",
    }
}

impl MailgunProvider {
    pub fn new(settings: &MailgunSettings, timeout: Duration) -> ProviderResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Auth("mailgun api key not decrypted".to_string()))?;

        Ok(Self {
            client: http_client(timeout)?,
            domain: settings.domain.clone(),
            api_base: api_base_for_region(&settings.region).to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmailProvider for MailgunProvider {
    async fn send(&self, request: &SendEmailRequest) -> ProviderResult<ProviderResponse> {
        let mut form: Vec<(String, String)> = vec![
            (
                "from".to_string(),
                format!("{} <{}>", request.from_name, request.from_address),
            ),
            ("to".to_string(), request.to.clone()),
            ("subject".to_string(), request.subject.clone()),
            ("html".to_string(), request.html.clone()),
            ("v:message_id".to_string(), request.message_id.clone()),
        ];

        if let Some(text) = &request.options.text {
            form.push(("text".to_string(), text.clone()));
        }
        if let Some(reply_to) = &request.options.reply_to {
            form.push(("h:Reply-To".to_string(), reply_to.clone()));
        }
        for cc in &request.options.cc {
            form.push(("cc".to_string(), cc.clone()));
        }
        for bcc in &request.options.bcc {
            form.push(("bcc".to_string(), bcc.clone()));
        }
        if let Some(url) = &request.options.list_unsubscribe_url {
            form.push(("h:List-Unsubscribe".to_string(), format!("<{url}>")));
            form.push((
                "h:List-Unsubscribe-Post".to_string(),
                "List-Unsubscribe=One-Click".to_string(),
            ));
        }
        if !request.options.attachments.is_empty() {
            // The form-encoded endpoint cannot carry binary parts.
            tracing::warn!(
                message_id = %request.message_id,
                "mailgun adapter drops attachments on the form-encoded path"
            );
        }

        let response = self
            .client
            .post(format!("{}/v3/{}/messages", self.api_base, self.domain))
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
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
            .map_err(|e| ProviderError::Transient(format!("mailgun response: {e}")))?;

        Ok(ProviderResponse {
            provider_message_id: parsed["id"].as_str().map(str::to_string),
        })
    }

    fn kind(&self) -> EmailProviderKind {
        EmailProviderKind::Mailgun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_endpoints() {
        assert_eq!(api_base_for_region("eu"), "https://api.eu.mailgun.net");
        assert_eq!(api_base_for_region("us"), "https://api.mailgun.net");
        assert_eq!(api_base_for_region("other"), "https://api.mailgun.net");
    }
}
