//! OAuth2 access-token exchange for XOAUTH2 SMTP/IMAP authentication.
//!
//! Google trades a long-lived refresh token for an access token; Microsoft
//! uses the tenant-scoped v2.0 token endpoint with the same grant.

use serde::Deserialize;

use mailtide_models::{OauthProviderKind, SmtpOauthSettings};

use crate::{ProviderError, ProviderResult};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn microsoft_token_url(tenant_id: &str) -> String {
    format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token")
}

/// Exchange the stored refresh token for a short-lived access token.
pub async fn fetch_access_token(settings: &SmtpOauthSettings) -> ProviderResult<String> {
    let refresh_token = settings
        .refresh_token
        .as_deref()
        .ok_or_else(|| ProviderError::Auth("oauth refresh token not decrypted".to_string()))?;
    let client_secret = settings
        .client_secret
        .as_deref()
        .ok_or_else(|| ProviderError::Auth("oauth client secret not decrypted".to_string()))?;

    let (url, scope) = match settings.provider {
        OauthProviderKind::Google => (GOOGLE_TOKEN_URL.to_string(), "https://mail.google.com/"),
        OauthProviderKind::Microsoft => {
            let tenant = settings.tenant_id.as_deref().ok_or_else(|| {
                ProviderError::Auth("microsoft oauth requires a tenant id".to_string())
            })?;
            (
                microsoft_token_url(tenant),
                "https://outlook.office365.com/.default offline_access",
            )
        }
    };

    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", client_secret),
        ("scope", scope),
    ];

    let client = reqwest::Client::new();
    let response = client.post(&url).form(&params).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // Token-endpoint rejections mean the grant is dead, not the network.
        return Err(match status.as_u16() {
            500..=599 => ProviderError::Transient(format!("token endpoint: HTTP {status}")),
            _ => ProviderError::Auth(format!("token endpoint: HTTP {status}: {body}")),
        });
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::Auth(format!("token endpoint body: {e}")))?;

    Ok(token.access_token)
}

/// The SASL XOAUTH2 initial client response for IMAP authentication.
pub fn xoauth2_initial_response(user: &str, access_token: &str) -> String {
    format!("user={user}\u{1}auth=Bearer {access_token}\u{1}\u{1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microsoft_token_url() {
        assert_eq!(
            microsoft_token_url("tenant-123"),
            "https://login.microsoftonline.com/tenant-123/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_xoauth2_initial_response_format() {
        let s = xoauth2_initial_response("a@b.test", "tok");
        assert!(s.starts_with("user=a@b.test\u{1}auth=Bearer tok"));
        assert!(s.ends_with("\u{1}\u{1}"));
    }

    #[tokio::test]
    async fn test_missing_secrets_fail_as_auth() {
        let settings = SmtpOauthSettings {
            provider: OauthProviderKind::Google,
            client_id: "cid".to_string(),
            client_secret: None,
            encrypted_client_secret: Some("deadbeef".to_string()),
            refresh_token: Some("rt".to_string()),
            encrypted_refresh_token: None,
            tenant_id: None,
        };
        assert!(matches!(
            fetch_access_token(&settings).await,
            Err(ProviderError::Auth(_))
        ));
    }
}
