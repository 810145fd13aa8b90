//! # Mailtide Core Domain Models
//!
//! This module contains the core domain models for the Mailtide email
//! delivery platform. All models implement serialization/deserialization
//! with serde; cross-field invariants are enforced by `validate()` methods.
//!
//! ## Key Models
//!
//! - **Workspace**: a tenant with its own database, settings and integrations
//! - **Integration**: a configured binding to an email provider, secrets
//!   stored as encrypted/plaintext field pairs
//! - **Contact**: a recipient keyed by normalized email, with typed custom
//!   fields and patch-merge semantics
//! - **Template**: a versioned visual block tree (MJML-family) or web payload
//! - **Broadcast**: a campaign with audience settings, A/B test phase and a
//!   monotonic status machine
//! - **QueueItem** / **MessageHistory**: the durable send queue row and the
//!   per-message engagement timeline it resolves into

pub mod broadcast;
pub mod common;
pub mod contact;
pub mod integration;
pub mod list;
pub mod message;
pub mod queue;
pub mod template;
pub mod workspace;

#[cfg(test)]
pub mod property_tests;

pub use broadcast::{
    AbTestSettings, AudienceSettings, Broadcast, BroadcastStatus, Schedule, Variation,
    WinnerMetric,
};
pub use common::{merge_field, NullableField};
pub use contact::{Contact, ContactPatch};
pub use integration::{
    BounceMailboxSettings, EmailIntegration, EmailProviderKind, Integration, IntegrationKind,
    MailgunSettings, MailjetSettings, OauthProviderKind, PostmarkSettings, Sender, SesSettings,
    SendGridSettings, SmtpOauthSettings, SmtpSettings, SparkPostSettings,
};
pub use list::{
    List, ListMembership, MembershipStatus, Segment, SegmentCondition, SegmentOp,
    SegmentPredicate,
};
pub use message::{EmailEvent, EmailEventKind, MessageHistory};
pub use queue::{NewQueueItem, QueueItem, QueuePayload, QueueStatus, SourceKind};
pub use template::{
    Block, BlockKind, Channel, EmailTemplate, Template, TemplateReference, WebTemplate,
};
pub use workspace::{Workspace, WorkspaceSettings};
