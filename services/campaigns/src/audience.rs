//! Audience enumeration.
//!
//! Cursor-based pages keyed `(email ASC)` over the contact repository,
//! filtered by the broadcast's audience settings. The cursor is the last
//! enqueued email; resume always starts strictly after it, so enumeration
//! is monotonic across crashes.

use anyhow::Result;

use mailtide_database::{AudienceMember, ContactsRepository};
use mailtide_models::AudienceSettings;

pub struct AudienceEnumerator<'a> {
    contacts: &'a ContactsRepository,
    audience: &'a AudienceSettings,
    batch_size: i64,
}

impl<'a> AudienceEnumerator<'a> {
    pub fn new(
        contacts: &'a ContactsRepository,
        audience: &'a AudienceSettings,
        batch_size: i64,
    ) -> Self {
        Self {
            contacts,
            audience,
            batch_size,
        }
    }

    /// One page strictly after `cursor`. An empty page means the audience
    /// is exhausted.
    pub async fn next_batch(&self, cursor: Option<&str>) -> Result<Vec<AudienceMember>> {
        self.contacts
            .audience_page(
                &self.audience.list_ids,
                &self.audience.segment_ids,
                self.audience.exclude_suppressed,
                cursor,
                self.batch_size,
            )
            .await
    }
}
