use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum MailtideError {
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Transient error: {message}")]
    Transient { message: String },

    #[error("Permanent send failure: {message}")]
    PermanentSend { message: String },

    #[error("Authentication error for integration {integration_id}: {message}")]
    Auth {
        integration_id: String,
        message: String,
    },

    #[error("Data integrity error: {message}")]
    DataIntegrity { message: String },

    #[error("Template render error in block {block_id}: {message}")]
    TemplateRender { block_id: String, message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MailtideError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent_send(message: impl Into<String>) -> Self {
        Self::PermanentSend {
            message: message.into(),
        }
    }

    pub fn auth(integration_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            integration_id: integration_id.into(),
            message: message.into(),
        }
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            message: message.into(),
        }
    }

    pub fn template_render(block_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateRender {
            block_id: block_id.into(),
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Transient { .. } => "TRANSIENT_ERROR",
            Self::PermanentSend { .. } => "PERMANENT_SEND_ERROR",
            Self::Auth { .. } => "AUTH_ERROR",
            Self::DataIntegrity { .. } => "DATA_INTEGRITY_ERROR",
            Self::TemplateRender { .. } => "TEMPLATE_RENDER_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether a send failing with this error should go back on the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimit { .. } | Self::Database { .. }
        )
    }
}

pub type MailtideResult<T> = Result<T, MailtideError>;

impl From<sqlx::Error> for MailtideError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            // Serialization failures and pool timeouts are worth retrying.
            sqlx::Error::PoolTimedOut => Self::transient(error.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                Self::transient(error.to_string())
            }
            sqlx::Error::RowNotFound => Self::not_found("row"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::data_integrity(error.to_string())
            }
            _ => Self::database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for MailtideError {
    fn from(error: serde_json::Error) -> Self {
        Self::data_integrity(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MailtideError::transient("timeout").is_retryable());
        assert!(MailtideError::database("deadlock").is_retryable());
        assert!(!MailtideError::permanent_send("bad recipient").is_retryable());
        assert!(!MailtideError::validation("email", "invalid").is_retryable());
        assert!(!MailtideError::auth("int-1", "expired key").is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MailtideError::template_render("blk-7", "missing child").error_code(),
            "TEMPLATE_RENDER_ERROR"
        );
        assert_eq!(
            MailtideError::not_found("template").error_code(),
            "NOT_FOUND"
        );
    }
}
