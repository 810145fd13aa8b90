//! Encrypt/decrypt passes over persisted models.
//!
//! Secret fields exist as paired plaintext/ciphertext struct fields. The
//! encrypt pass fills the ciphertext side and clears the plaintext before
//! anything is written; the decrypt pass repopulates plaintext after load.
//! Repositories call these at the boundary so callers never see ciphertext.

use anyhow::Result;

use mailtide_models::{EmailIntegration, Integration, WorkspaceSettings};
use mailtide_utils::crypto::{decrypt_secret, encrypt_secret};

fn encrypt_pair(
    plain: &mut Option<String>,
    encrypted: &mut Option<String>,
    passphrase: &str,
) -> Result<()> {
    if let Some(value) = plain.take() {
        *encrypted = Some(encrypt_secret(&value, passphrase)?);
    }
    Ok(())
}

fn decrypt_pair(
    plain: &mut Option<String>,
    encrypted: &Option<String>,
    passphrase: &str,
) -> Result<()> {
    if plain.is_none() {
        if let Some(ciphertext) = encrypted {
            *plain = Some(decrypt_secret(ciphertext, passphrase)?);
        }
    }
    Ok(())
}

pub fn encrypt_workspace_settings(
    settings: &mut WorkspaceSettings,
    passphrase: &str,
) -> Result<()> {
    encrypt_pair(
        &mut settings.secret_key,
        &mut settings.encrypted_secret_key,
        passphrase,
    )
}

pub fn decrypt_workspace_settings(
    settings: &mut WorkspaceSettings,
    passphrase: &str,
) -> Result<()> {
    decrypt_pair(
        &mut settings.secret_key,
        &settings.encrypted_secret_key.clone(),
        passphrase,
    )
}

pub fn encrypt_integration_secrets(integration: &mut Integration, passphrase: &str) -> Result<()> {
    if let Some(email) = integration.email.as_mut() {
        encrypt_email_secrets(email, passphrase)?;
    }
    Ok(())
}

pub fn decrypt_integration_secrets(integration: &mut Integration, passphrase: &str) -> Result<()> {
    if let Some(email) = integration.email.as_mut() {
        decrypt_email_secrets(email, passphrase)?;
    }
    Ok(())
}

fn encrypt_email_secrets(email: &mut EmailIntegration, passphrase: &str) -> Result<()> {
    if let Some(smtp) = email.smtp.as_mut() {
        encrypt_pair(&mut smtp.password, &mut smtp.encrypted_password, passphrase)?;
        if let Some(oauth) = smtp.oauth.as_mut() {
            encrypt_pair(
                &mut oauth.client_secret,
                &mut oauth.encrypted_client_secret,
                passphrase,
            )?;
            encrypt_pair(
                &mut oauth.refresh_token,
                &mut oauth.encrypted_refresh_token,
                passphrase,
            )?;
        }
        if let Some(mailbox) = smtp.bounce_mailbox.as_mut() {
            encrypt_pair(
                &mut mailbox.password,
                &mut mailbox.encrypted_password,
                passphrase,
            )?;
        }
    }
    if let Some(ses) = email.ses.as_mut() {
        encrypt_pair(
            &mut ses.secret_access_key,
            &mut ses.encrypted_secret_access_key,
            passphrase,
        )?;
    }
    if let Some(sparkpost) = email.sparkpost.as_mut() {
        encrypt_pair(
            &mut sparkpost.api_key,
            &mut sparkpost.encrypted_api_key,
            passphrase,
        )?;
    }
    if let Some(postmark) = email.postmark.as_mut() {
        encrypt_pair(
            &mut postmark.server_token,
            &mut postmark.encrypted_server_token,
            passphrase,
        )?;
    }
    if let Some(mailgun) = email.mailgun.as_mut() {
        encrypt_pair(
            &mut mailgun.api_key,
            &mut mailgun.encrypted_api_key,
            passphrase,
        )?;
    }
    if let Some(mailjet) = email.mailjet.as_mut() {
        encrypt_pair(
            &mut mailjet.secret_key,
            &mut mailjet.encrypted_secret_key,
            passphrase,
        )?;
    }
    if let Some(sendgrid) = email.sendgrid.as_mut() {
        encrypt_pair(
            &mut sendgrid.api_key,
            &mut sendgrid.encrypted_api_key,
            passphrase,
        )?;
    }
    Ok(())
}

fn decrypt_email_secrets(email: &mut EmailIntegration, passphrase: &str) -> Result<()> {
    if let Some(smtp) = email.smtp.as_mut() {
        decrypt_pair(
            &mut smtp.password,
            &smtp.encrypted_password.clone(),
            passphrase,
        )?;
        if let Some(oauth) = smtp.oauth.as_mut() {
            decrypt_pair(
                &mut oauth.client_secret,
                &oauth.encrypted_client_secret.clone(),
                passphrase,
            )?;
            decrypt_pair(
                &mut oauth.refresh_token,
                &oauth.encrypted_refresh_token.clone(),
                passphrase,
            )?;
        }
        if let Some(mailbox) = smtp.bounce_mailbox.as_mut() {
            decrypt_pair(
                &mut mailbox.password,
                &mailbox.encrypted_password.clone(),
                passphrase,
            )?;
        }
    }
    if let Some(ses) = email.ses.as_mut() {
        decrypt_pair(
            &mut ses.secret_access_key,
            &ses.encrypted_secret_access_key.clone(),
            passphrase,
        )?;
    }
    if let Some(sparkpost) = email.sparkpost.as_mut() {
        decrypt_pair(
            &mut sparkpost.api_key,
            &sparkpost.encrypted_api_key.clone(),
            passphrase,
        )?;
    }
    if let Some(postmark) = email.postmark.as_mut() {
        decrypt_pair(
            &mut postmark.server_token,
            &postmark.encrypted_server_token.clone(),
            passphrase,
        )?;
    }
    if let Some(mailgun) = email.mailgun.as_mut() {
        decrypt_pair(
            &mut mailgun.api_key,
            &mailgun.encrypted_api_key.clone(),
            passphrase,
        )?;
    }
    if let Some(mailjet) = email.mailjet.as_mut() {
        decrypt_pair(
            &mut mailjet.secret_key,
            &mailjet.encrypted_secret_key.clone(),
            passphrase,
        )?;
    }
    if let Some(sendgrid) = email.sendgrid.as_mut() {
        decrypt_pair(
            &mut sendgrid.api_key,
            &sendgrid.encrypted_api_key.clone(),
            passphrase,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailtide_models::{
        EmailProviderKind, IntegrationKind, PostmarkSettings, Sender, SmtpSettings,
    };

    fn smtp_integration() -> Integration {
        Integration {
            id: "int-1".to_string(),
            name: "Primary SMTP".to_string(),
            kind: IntegrationKind::Email,
            email: Some(EmailIntegration {
                provider: EmailProviderKind::Smtp,
                senders: vec![Sender {
                    id: "s-1".to_string(),
                    email: "noreply@acme.test".to_string(),
                    name: "Acme".to_string(),
                    is_default: true,
                }],
                rate_limit_per_minute: 60,
                smtp: Some(SmtpSettings {
                    host: "smtp.acme.test".to_string(),
                    port: 587,
                    use_tls: true,
                    username: "mailer".to_string(),
                    password: Some("hunter2".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_encrypt_clears_plaintext_and_decrypt_restores() {
        let mut integration = smtp_integration();
        encrypt_integration_secrets(&mut integration, "master").unwrap();

        let smtp = integration.email.as_ref().unwrap().smtp.as_ref().unwrap();
        assert!(smtp.password.is_none());
        assert!(smtp.encrypted_password.is_some());

        decrypt_integration_secrets(&mut integration, "master").unwrap();
        let smtp = integration.email.as_ref().unwrap().smtp.as_ref().unwrap();
        assert_eq!(smtp.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_serialized_form_never_contains_plaintext() {
        let mut integration = smtp_integration();
        encrypt_integration_secrets(&mut integration, "master").unwrap();
        let json = serde_json::to_string(&integration).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_workspace_secret_key_round_trip() {
        let mut settings = WorkspaceSettings {
            secret_key: Some("ws-secret".to_string()),
            ..Default::default()
        };

        encrypt_workspace_settings(&mut settings, "master").unwrap();
        assert!(settings.secret_key.is_none());
        assert!(settings.encrypted_secret_key.is_some());

        decrypt_workspace_settings(&mut settings, "master").unwrap();
        assert_eq!(settings.secret_key.as_deref(), Some("ws-secret"));
    }

    #[test]
    fn test_postmark_token_pass() {
        let mut integration = smtp_integration();
        let email = integration.email.as_mut().unwrap();
        email.provider = EmailProviderKind::Postmark;
        email.smtp = None;
        email.postmark = Some(PostmarkSettings {
            server_token: Some("pm-token".to_string()),
            encrypted_server_token: None,
        });

        encrypt_integration_secrets(&mut integration, "master").unwrap();
        let postmark = integration.email.as_ref().unwrap().postmark.as_ref().unwrap();
        assert!(postmark.server_token.is_none());

        decrypt_integration_secrets(&mut integration, "master").unwrap();
        let postmark = integration.email.as_ref().unwrap().postmark.as_ref().unwrap();
        assert_eq!(postmark.server_token.as_deref(), Some("pm-token"));
    }
}
