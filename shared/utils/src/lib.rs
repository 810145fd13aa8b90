//! Shared utilities for the Mailtide platform: layered configuration,
//! the platform error type, tracing setup, secrets-at-rest crypto and
//! validation helpers.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::AppConfig;
pub use error::{MailtideError, MailtideResult};
