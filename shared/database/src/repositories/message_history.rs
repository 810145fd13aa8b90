//! Message History Repository
//!
//! The per-workspace engagement timeline. Every `*_at` column is set at
//! most once (`COALESCE(existing, incoming)`); repeat opens/clicks bump
//! counters without rewinding timestamps, so the sent ≤ delivered ≤
//! (opened, clicked) ordering holds no matter how events interleave.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use mailtide_models::{EmailEventKind, MessageHistory, QueueItem, TemplateReference};

pub struct MessageHistoryRepository {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
pub struct VariationStats {
    pub template_id: String,
    pub template_version: i32,
    pub sent: i64,
    pub opens: i64,
    pub clicks: i64,
}

impl MessageHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the full row when a worker records a successful send.
    pub async fn record_send(&self, item: &QueueItem, sent_at: DateTime<Utc>) -> Result<()> {
        let broadcast_id = (item.source == mailtide_models::SourceKind::Broadcast)
            .then(|| item.source_id.clone());
        let automation_id = (item.source == mailtide_models::SourceKind::Automation)
            .then(|| item.source_id.clone());
        let external_id = (item.source == mailtide_models::SourceKind::Transactional)
            .then(|| item.source_id.clone())
            .filter(|id| !id.is_empty());

        sqlx::query(
            r#"
            INSERT INTO message_history
                (message_id, channel, contact_email, template_id, template_version,
                 broadcast_id, automation_id, external_id, sent_at, created_at, updated_at)
            VALUES ($1, 'email', $2, $3, $4, $5, $6, $7, $8, $8, $8)
            ON CONFLICT (message_id) DO UPDATE
            SET sent_at = COALESCE(message_history.sent_at, EXCLUDED.sent_at),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&item.message_id)
        .bind(&item.contact_email)
        .bind(&item.template.id)
        .bind(item.template.version)
        .bind(&broadcast_id)
        .bind(&automation_id)
        .bind(&external_id)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .context("Failed to record send")?;

        Ok(())
    }

    /// Apply one engagement event: set the matching timestamp iff NULL and
    /// bump counters. Re-applying the same (message_id, kind, time) is a
    /// no-op on the timestamp by construction.
    pub async fn apply_event(
        &self,
        message_id: &str,
        kind: EmailEventKind,
        time: DateTime<Utc>,
        recipient: Option<&str>,
    ) -> Result<bool> {
        let column = timestamp_column(kind);

        let sql = format!(
            r#"
            UPDATE message_history
            SET {column} = COALESCE({column}, $2),
                open_count = open_count + $3,
                click_count = click_count + $4,
                updated_at = $5
            WHERE message_id = $1
            "#,
        );

        let result = sqlx::query(&sql)
            .bind(message_id)
            .bind(time)
            .bind(i32::from(kind == EmailEventKind::Opened))
            .bind(i32::from(kind == EmailEventKind::Clicked))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to apply engagement event")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Unknown message id: provider feedback can arrive before (or
        // without) a sent record. Create a minimal row when we at least
        // know the recipient.
        let Some(recipient) = recipient else {
            return Ok(false);
        };

        let sql = format!(
            r#"
            INSERT INTO message_history
                (message_id, channel, contact_email, template_id, template_version,
                 {column}, open_count, click_count, created_at, updated_at)
            VALUES ($1, 'email', $2, '', 0, $3, $4, $5, $6, $6)
            ON CONFLICT (message_id) DO UPDATE
            SET {column} = COALESCE(message_history.{column}, EXCLUDED.{column}),
                updated_at = EXCLUDED.updated_at
            "#,
        );

        sqlx::query(&sql)
            .bind(message_id)
            .bind(recipient)
            .bind(time)
            .bind(i32::from(kind == EmailEventKind::Opened))
            .bind(i32::from(kind == EmailEventKind::Clicked))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to insert engagement row")?;

        Ok(true)
    }

    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<MessageHistory>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT message_id, channel, contact_email, template_id, template_version,
                   broadcast_id, automation_id, external_id,
                   sent_at, delivered_at, bounced_at, complained_at, opened_at,
                   clicked_at, unsubscribed_at, failed_at, open_count, click_count,
                   created_at, updated_at
            FROM message_history
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch message history")?;

        Ok(row.map(|r| r.into()))
    }

    /// Latest message sent to a recipient; the fallback when feedback only
    /// names an address.
    pub async fn find_latest_by_email(&self, email: &str) -> Result<Option<MessageHistory>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT message_id, channel, contact_email, template_id, template_version,
                   broadcast_id, automation_id, external_id,
                   sent_at, delivered_at, bounced_at, complained_at, opened_at,
                   clicked_at, unsubscribed_at, failed_at, open_count, click_count,
                   created_at, updated_at
            FROM message_history
            WHERE contact_email = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest message for contact")?;

        Ok(row.map(|r| r.into()))
    }

    /// Which of the given message ids already have history rows. The
    /// sending phase uses this to skip recipients the test phase covered.
    pub async fn existing_message_ids(&self, message_ids: &[String]) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT message_id FROM message_history WHERE message_id = ANY($1)",
        )
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to check existing message ids")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Engagement grouped by variation, for A/B winner selection.
    pub async fn variation_stats(&self, broadcast_id: &str) -> Result<Vec<VariationStats>> {
        let stats: Vec<VariationStats> = sqlx::query_as(
            r#"
            SELECT template_id, template_version,
                   COUNT(sent_at) AS sent,
                   COUNT(opened_at) AS opens,
                   COUNT(clicked_at) AS clicks
            FROM message_history
            WHERE broadcast_id = $1
            GROUP BY template_id, template_version
            ORDER BY template_id ASC, template_version ASC
            "#,
        )
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate variation stats")?;

        Ok(stats)
    }

    /// Distinct recipients already recorded for a broadcast, used to skip
    /// test-phase recipients during the sending phase.
    pub async fn broadcast_recipient_count(&self, broadcast_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT contact_email) FROM message_history WHERE broadcast_id = $1",
        )
        .bind(broadcast_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count broadcast recipients")?;
        Ok(count)
    }
}

fn timestamp_column(kind: EmailEventKind) -> &'static str {
    match kind {
        EmailEventKind::Sent => "sent_at",
        EmailEventKind::Delivered => "delivered_at",
        EmailEventKind::Bounced => "bounced_at",
        EmailEventKind::Complained => "complained_at",
        EmailEventKind::Opened => "opened_at",
        EmailEventKind::Clicked => "clicked_at",
        EmailEventKind::Unsubscribed => "unsubscribed_at",
        EmailEventKind::Failed => "failed_at",
    }
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    message_id: String,
    channel: String,
    contact_email: String,
    template_id: String,
    template_version: i32,
    broadcast_id: Option<String>,
    automation_id: Option<String>,
    external_id: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    bounced_at: Option<DateTime<Utc>>,
    complained_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    clicked_at: Option<DateTime<Utc>>,
    unsubscribed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    open_count: i32,
    click_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<HistoryRow> for MessageHistory {
    fn from(row: HistoryRow) -> Self {
        Self {
            message_id: row.message_id,
            channel: row.channel,
            contact_email: row.contact_email,
            template: TemplateReference::new(row.template_id, row.template_version),
            broadcast_id: row.broadcast_id,
            automation_id: row.automation_id,
            external_id: row.external_id,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            bounced_at: row.bounced_at,
            complained_at: row.complained_at,
            opened_at: row.opened_at,
            clicked_at: row.clicked_at,
            unsubscribed_at: row.unsubscribed_at,
            failed_at: row.failed_at,
            open_count: row.open_count,
            click_count: row.click_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_column_mapping() {
        assert_eq!(timestamp_column(EmailEventKind::Sent), "sent_at");
        assert_eq!(timestamp_column(EmailEventKind::Unsubscribed), "unsubscribed_at");
        assert_eq!(timestamp_column(EmailEventKind::Failed), "failed_at");
    }
}
