pub mod broadcasts;
pub mod contacts;
pub mod email_queue;
pub mod lists;
pub mod message_history;
pub mod segments;
pub mod templates;
pub mod webhook_deliveries;

pub use broadcasts::BroadcastsRepository;
pub use contacts::{AudienceMember, ContactsRepository};
pub use email_queue::{backoff_with_jitter, EmailQueueRepository, FailureOutcome};
pub use lists::ListsRepository;
pub use message_history::{MessageHistoryRepository, VariationStats};
pub use segments::SegmentsRepository;
pub use templates::TemplatesRepository;
pub use webhook_deliveries::WebhookDeliveriesRepository;
