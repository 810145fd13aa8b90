use crate::error::{MailtideError, MailtideResult};
use regex::Regex;
use std::sync::OnceLock;
use validator::{Validate, ValidationErrors};

pub fn validate_model<T: Validate>(model: &T) -> MailtideResult<()> {
    match model.validate() {
        Ok(()) => Ok(()),
        Err(errors) => {
            let error_messages = format_validation_errors(&errors);
            Err(MailtideError::validation("model", error_messages))
        }
    }
}

pub fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages = Vec::new();

    for (field, field_errors) in errors.field_errors() {
        for error in field_errors {
            let message = match &error.code {
                std::borrow::Cow::Borrowed("email") => "Invalid email format".to_string(),
                std::borrow::Cow::Borrowed("length") => {
                    format!("Length validation failed for field '{}'", field)
                }
                std::borrow::Cow::Borrowed("range") => {
                    format!("Value out of range for field '{}'", field)
                }
                std::borrow::Cow::Borrowed("required") => {
                    format!("Field '{}' is required", field)
                }
                _ => format!("Validation failed for field '{}': {}", field, error.code),
            };
            messages.push(message);
        }
    }

    messages.join(", ")
}

/// Trim every kind of Unicode whitespace from a contact email, including
/// NBSP and zero-width characters pasted in from rich-text sources, and
/// lowercase the result.
pub fn normalize_email(email: &str) -> String {
    email
        .trim_matches(|c: char| {
            c.is_whitespace() || matches!(c, '\u{00a0}' | '\u{200b}' | '\u{200c}' | '\u{feff}')
        })
        .to_lowercase()
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .unwrap()
    })
}

pub fn validate_email_address(email: &str) -> MailtideResult<()> {
    if !email_regex().is_match(email) {
        return Err(MailtideError::validation(
            "email",
            "Invalid email address format",
        ));
    }

    Ok(())
}

/// Workspace ids are alphanumeric, at most 32 characters, and become part
/// of the workspace database name.
pub fn validate_workspace_id(id: &str) -> MailtideResult<()> {
    if id.is_empty() || id.len() > 32 {
        return Err(MailtideError::validation(
            "workspace_id",
            "Workspace id must be 1-32 characters",
        ));
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MailtideError::validation(
            "workspace_id",
            "Workspace id must be alphanumeric",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email_trims_unicode_whitespace() {
        assert_eq!(normalize_email("\u{00a0}A@B.Test \u{200b}"), "a@b.test");
        assert_eq!(normalize_email("  user@example.com\n"), "user@example.com");
        assert_eq!(normalize_email("\u{feff}x@y.test"), "x@y.test");
    }

    #[test]
    fn test_validate_email_address() {
        assert!(validate_email_address("test@example.com").is_ok());
        assert!(validate_email_address("invalid-email").is_err());
        assert!(validate_email_address("@example.com").is_err());
    }

    #[test]
    fn test_validate_workspace_id() {
        assert!(validate_workspace_id("acme1").is_ok());
        assert!(validate_workspace_id("").is_err());
        assert!(validate_workspace_id("has-dash").is_err());
        assert!(validate_workspace_id(&"a".repeat(33)).is_err());
    }
}
