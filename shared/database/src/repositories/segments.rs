//! Segments Repository
//!
//! Segments store a predicate over contact fields; membership is a
//! materialized table refreshed periodically, not evaluated per read.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{FromRow, PgPool};

use mailtide_models::{Contact, Segment};

pub struct SegmentsRepository {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct SegmentRow {
    id: String,
    name: String,
    predicate: serde_json::Value,
    refreshed_at: Option<chrono::DateTime<Utc>>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<SegmentRow> for Segment {
    type Error = anyhow::Error;

    fn try_from(row: SegmentRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            predicate: serde_json::from_value(row.predicate)
                .context("Failed to decode segment predicate")?,
            refreshed_at: row.refreshed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl SegmentsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Segment>> {
        let row: Option<SegmentRow> = sqlx::query_as(
            r#"
            SELECT id, name, predicate, refreshed_at, created_at, updated_at
            FROM segments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch segment")?;

        row.map(Segment::try_from).transpose()
    }

    pub async fn save(&self, segment: &Segment) -> Result<()> {
        let predicate = serde_json::to_value(&segment.predicate)?;
        sqlx::query(
            r#"
            INSERT INTO segments (id, name, predicate, refreshed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, predicate = EXCLUDED.predicate,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&segment.id)
        .bind(&segment.name)
        .bind(&predicate)
        .bind(segment.refreshed_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to save segment")?;
        Ok(())
    }

    /// Recompute the materialized membership by walking all contacts in
    /// email-ordered pages and evaluating the predicate.
    pub async fn refresh_membership(&self, segment_id: &str) -> Result<u64> {
        let segment = self
            .find_by_id(segment_id)
            .await?
            .context("Segment not found")?;

        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        sqlx::query("DELETE FROM segment_memberships WHERE segment_id = $1")
            .bind(segment_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear segment membership")?;

        let mut matched: u64 = 0;
        let mut cursor = String::new();
        loop {
            let contacts: Vec<Contact> = sqlx::query_as(
                "SELECT * FROM contacts WHERE email > $1 ORDER BY email ASC LIMIT 500",
            )
            .bind(&cursor)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to page contacts for segment refresh")?;

            let Some(last) = contacts.last() else {
                break;
            };
            cursor = last.email.clone();

            for contact in &contacts {
                if segment.predicate.matches(contact) {
                    sqlx::query(
                        r#"
                        INSERT INTO segment_memberships (segment_id, contact_email)
                        VALUES ($1, $2)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(segment_id)
                    .bind(&contact.email)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to insert segment membership")?;
                    matched += 1;
                }
            }
        }

        sqlx::query("UPDATE segments SET refreshed_at = $2, updated_at = $2 WHERE id = $1")
            .bind(segment_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .context("Failed to stamp segment refresh")?;

        tx.commit().await.context("Failed to commit segment refresh")?;

        tracing::info!(segment_id, matched, "segment membership refreshed");
        Ok(matched)
    }
}
