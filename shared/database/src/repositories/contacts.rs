//! Contacts Repository
//!
//! Upserts normalize the email (Unicode whitespace, NBSP included, is
//! trimmed and the address lowercased) before it becomes the row identity.
//! The audience query feeds the broadcast orchestrator: cursor-keyed on
//! `(email ASC)`, one row per contact, suppressed and flagged contacts
//! excluded.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{FromRow, PgPool};

use mailtide_models::{Contact, ContactPatch};
use mailtide_utils::validation::{normalize_email, validate_email_address};

pub struct ContactsRepository {
    pool: PgPool,
}

/// One (contact, list) pair of an enumerated audience batch.
#[derive(Debug, Clone, FromRow)]
pub struct AudienceMember {
    #[sqlx(flatten)]
    pub contact: Contact,
    pub list_id: String,
    pub list_name: String,
}

impl ContactsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Contact>> {
        let normalized = normalize_email(email);
        let contact: Option<Contact> = sqlx::query_as(
            r#"
            SELECT * FROM contacts WHERE email = $1
            "#,
        )
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch contact")?;

        Ok(contact)
    }

    /// Insert or update a contact under its normalized email.
    pub async fn upsert(&self, contact: &Contact) -> Result<Contact> {
        let email = normalize_email(&contact.email);
        validate_email_address(&email)?;
        let now = Utc::now();

        let stored: Contact = sqlx::query_as(
            r#"
            INSERT INTO contacts
                (email, external_id, timezone, language, first_name, last_name, phone,
                 address_line_1, address_line_2, country, postcode, state, job_title,
                 custom_string_1, custom_string_2, custom_string_3, custom_string_4, custom_string_5,
                 custom_number_1, custom_number_2, custom_number_3, custom_number_4, custom_number_5,
                 custom_datetime_1, custom_datetime_2, custom_datetime_3, custom_datetime_4, custom_datetime_5,
                 custom_json_1, custom_json_2, custom_json_3, custom_json_4, custom_json_5,
                 deliverability_flagged, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23,
                    $24, $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, $35, $35)
            ON CONFLICT (email) DO UPDATE
            SET external_id = EXCLUDED.external_id,
                timezone = EXCLUDED.timezone,
                language = EXCLUDED.language,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                phone = EXCLUDED.phone,
                address_line_1 = EXCLUDED.address_line_1,
                address_line_2 = EXCLUDED.address_line_2,
                country = EXCLUDED.country,
                postcode = EXCLUDED.postcode,
                state = EXCLUDED.state,
                job_title = EXCLUDED.job_title,
                custom_string_1 = EXCLUDED.custom_string_1,
                custom_string_2 = EXCLUDED.custom_string_2,
                custom_string_3 = EXCLUDED.custom_string_3,
                custom_string_4 = EXCLUDED.custom_string_4,
                custom_string_5 = EXCLUDED.custom_string_5,
                custom_number_1 = EXCLUDED.custom_number_1,
                custom_number_2 = EXCLUDED.custom_number_2,
                custom_number_3 = EXCLUDED.custom_number_3,
                custom_number_4 = EXCLUDED.custom_number_4,
                custom_number_5 = EXCLUDED.custom_number_5,
                custom_datetime_1 = EXCLUDED.custom_datetime_1,
                custom_datetime_2 = EXCLUDED.custom_datetime_2,
                custom_datetime_3 = EXCLUDED.custom_datetime_3,
                custom_datetime_4 = EXCLUDED.custom_datetime_4,
                custom_datetime_5 = EXCLUDED.custom_datetime_5,
                custom_json_1 = EXCLUDED.custom_json_1,
                custom_json_2 = EXCLUDED.custom_json_2,
                custom_json_3 = EXCLUDED.custom_json_3,
                custom_json_4 = EXCLUDED.custom_json_4,
                custom_json_5 = EXCLUDED.custom_json_5,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&email)
        .bind(&contact.external_id)
        .bind(&contact.timezone)
        .bind(&contact.language)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.phone)
        .bind(&contact.address_line_1)
        .bind(&contact.address_line_2)
        .bind(&contact.country)
        .bind(&contact.postcode)
        .bind(&contact.state)
        .bind(&contact.job_title)
        .bind(&contact.custom_string_1)
        .bind(&contact.custom_string_2)
        .bind(&contact.custom_string_3)
        .bind(&contact.custom_string_4)
        .bind(&contact.custom_string_5)
        .bind(contact.custom_number_1)
        .bind(contact.custom_number_2)
        .bind(contact.custom_number_3)
        .bind(contact.custom_number_4)
        .bind(contact.custom_number_5)
        .bind(contact.custom_datetime_1)
        .bind(contact.custom_datetime_2)
        .bind(contact.custom_datetime_3)
        .bind(contact.custom_datetime_4)
        .bind(contact.custom_datetime_5)
        .bind(&contact.custom_json_1)
        .bind(&contact.custom_json_2)
        .bind(&contact.custom_json_3)
        .bind(&contact.custom_json_4)
        .bind(&contact.custom_json_5)
        .bind(contact.deliverability_flagged)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert contact")?;

        Ok(stored)
    }

    /// Apply a partial update under a row lock.
    pub async fn patch(&self, email: &str, patch: ContactPatch) -> Result<Option<Contact>> {
        let normalized = normalize_email(email);
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let existing: Option<Contact> =
            sqlx::query_as("SELECT * FROM contacts WHERE email = $1 FOR UPDATE")
                .bind(&normalized)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to lock contact")?;

        let Some(mut contact) = existing else {
            return Ok(None);
        };

        contact.apply_patch(patch);
        drop(tx);

        Ok(Some(self.upsert(&contact).await?))
    }

    /// Raise the contact-wide deliverability flag.
    pub async fn flag_deliverability(&self, email: &str) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET deliverability_flagged = TRUE, updated_at = $2 WHERE email = $1",
        )
        .bind(normalize_email(email))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to flag contact deliverability")?;
        Ok(())
    }

    /// One page of a broadcast audience, strictly after `cursor`, ordered
    /// by email. Contacts whose membership on any selected list is
    /// suppressed are excluded, as are deliverability-flagged contacts.
    pub async fn audience_page(
        &self,
        list_ids: &[String],
        segment_ids: &[String],
        exclude_suppressed: bool,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AudienceMember>> {
        let members: Vec<AudienceMember> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (c.email) c.*, lm.list_id AS list_id, l.name AS list_name
            FROM contacts c
            JOIN list_memberships lm ON lm.contact_email = c.email
            JOIN lists l ON l.id = lm.list_id
            WHERE lm.list_id = ANY($1)
              AND lm.status = 'active'
              AND c.email > COALESCE($2, '')
              AND c.deliverability_flagged = FALSE
              AND ($3 = FALSE OR NOT EXISTS (
                    SELECT 1 FROM list_memberships bad
                    WHERE bad.contact_email = c.email
                      AND bad.list_id = ANY($1)
                      AND bad.status IN ('unsubscribed', 'bounced', 'complained')
              ))
              AND (cardinality($4::varchar[]) = 0 OR EXISTS (
                    SELECT 1 FROM segment_memberships sm
                    WHERE sm.contact_email = c.email AND sm.segment_id = ANY($4)
              ))
            ORDER BY c.email ASC, lm.list_id ASC
            LIMIT $5
            "#,
        )
        .bind(list_ids)
        .bind(cursor)
        .bind(exclude_suppressed)
        .bind(segment_ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to enumerate audience page")?;

        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Repository behavior is covered by the ignored PostgreSQL tests in
    // tests/; normalization is unit-testable here.
    #[test]
    fn test_upsert_uses_normalized_identity() {
        assert_eq!(normalize_email("\u{00a0}User@Acme.Test "), "user@acme.test");
    }
}
