//! Email Queue Repository
//!
//! Durable priority queue of outbound emails. Claims are single-statement
//! `UPDATE … RETURNING` over a `FOR UPDATE SKIP LOCKED` subselect, so a row
//! is never held by two workers. Enqueue dedups on
//! (integration_id, message_id), which lets the broadcast orchestrator be
//! retried safely after a partial crash.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{FromRow, PgPool};

use mailtide_models::{
    EmailProviderKind, NewQueueItem, QueueItem, QueuePayload, QueueStatus, SourceKind,
    TemplateReference,
};

/// Backoff base for the first retry.
const BACKOFF_BASE_SECS: i64 = 60;
/// Backoff ceiling.
const BACKOFF_CAP_SECS: i64 = 3600;

pub struct EmailQueueRepository {
    pool: PgPool,
}

/// What `ack_failure` decided to do with the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending with a scheduled retry.
    Retried,
    /// Attempts exhausted or error terminal; row marked failed.
    Exhausted,
}

impl EmailQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert rows as pending. Conflicting (integration_id, message_id)
    /// pairs are silently skipped; returns how many rows were inserted.
    pub async fn enqueue(&self, items: &[NewQueueItem]) -> Result<u64> {
        let mut inserted = 0;
        let now = Utc::now();

        for item in items {
            let payload = serde_json::to_value(&item.payload)?;
            let provider = enum_str(&item.provider)?;
            let source = item.source.as_str();

            let result = sqlx::query(
                r#"
                INSERT INTO email_queue
                    (message_id, contact_email, template_id, template_version,
                     integration_id, provider, source, source_id, priority,
                     status, attempts, max_attempts, next_retry_at, payload,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                        'pending', 0, $10, $11, $12, $13, $13)
                ON CONFLICT (integration_id, message_id) DO NOTHING
                "#,
            )
            .bind(&item.message_id)
            .bind(&item.contact_email)
            .bind(&item.template.id)
            .bind(item.template.version)
            .bind(&item.integration_id)
            .bind(&provider)
            .bind(source)
            .bind(&item.source_id)
            .bind(item.priority)
            .bind(item.max_attempts)
            .bind(now)
            .bind(&payload)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to enqueue email")?;

            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    /// Atomically claim up to `limit` due rows for a worker, ordered by
    /// (priority ASC, created_at ASC, id ASC).
    pub async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            UPDATE email_queue
            SET status = 'processing', attempts = attempts + 1,
                claimed_by = $1, updated_at = $3
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE status = 'pending' AND next_retry_at <= $3
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, message_id, contact_email, template_id, template_version,
                      integration_id, provider, source, source_id, priority, status,
                      attempts, max_attempts, next_retry_at, payload, created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim queue rows")?;

        rows.into_iter().map(QueueRow::try_into_item).collect()
    }

    /// Delivery succeeded; the row is done.
    pub async fn ack_success(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM email_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to ack queue row")?;
        Ok(())
    }

    /// Delivery failed. Retryable errors under the attempt cap go back to
    /// pending with exponential backoff; everything else is marked failed.
    pub async fn ack_failure(
        &self,
        id: i64,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let row: Option<(i32, i32)> =
            sqlx::query_as("SELECT attempts, max_attempts FROM email_queue WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read queue row for failure ack")?;

        let Some((attempts, max_attempts)) = row else {
            return Ok(FailureOutcome::Exhausted);
        };

        if retryable && attempts < max_attempts {
            let next_retry_at = now + backoff_with_jitter(attempts);
            sqlx::query(
                r#"
                UPDATE email_queue
                SET status = 'pending', next_retry_at = $2, claimed_by = NULL, updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(next_retry_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to reschedule queue row")?;

            tracing::debug!(id, attempts, reason, "send rescheduled");
            Ok(FailureOutcome::Retried)
        } else {
            sqlx::query(
                r#"
                UPDATE email_queue
                SET status = 'failed', next_retry_at = 'infinity', claimed_by = NULL, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to mark queue row failed")?;

            tracing::warn!(id, attempts, reason, "send failed permanently");
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Cancellation path: put the row back without consuming an attempt.
    pub async fn release(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending', attempts = GREATEST(attempts - 1, 0),
                claimed_by = NULL, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to release queue row")?;
        Ok(())
    }

    /// Rows stuck in processing beyond the lease window go back to pending
    /// with attempts unchanged. Returns how many were recovered.
    pub async fn recover(&self, lease: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - lease;
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending', claimed_by = NULL, next_retry_at = $2, updated_at = $2
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to recover stuck queue rows")?;

        if result.rows_affected() > 0 {
            tracing::warn!(count = result.rows_affected(), "recovered stuck queue rows");
        }
        Ok(result.rows_affected())
    }

    /// Delete pending rows belonging to a cancelled source.
    pub async fn purge_source(&self, source: SourceKind, source_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM email_queue WHERE source = $1 AND source_id = $2 AND status = 'pending'",
        )
        .bind(source.as_str())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .context("Failed to purge queue rows")?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM email_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .context("Failed to count pending rows")?;
        Ok(count)
    }
}

/// Exponential backoff with jitter: base 60 s doubling per attempt, capped
/// at one hour, jittered into the upper half of the window.
pub fn backoff_with_jitter(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 10) as u32;
    let full = (BACKOFF_BASE_SECS * 2i64.pow(exponent)).min(BACKOFF_CAP_SECS);
    let jittered = rand::thread_rng().gen_range((full / 2)..=full);
    Duration::seconds(jittered)
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: i64,
    message_id: String,
    contact_email: String,
    template_id: String,
    template_version: i32,
    integration_id: String,
    provider: String,
    source: String,
    source_id: String,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueRow {
    fn try_into_item(self) -> Result<QueueItem> {
        let payload: QueuePayload =
            serde_json::from_value(self.payload).context("Failed to decode queue payload")?;

        Ok(QueueItem {
            id: self.id,
            message_id: self.message_id,
            contact_email: self.contact_email,
            template: TemplateReference::new(self.template_id, self.template_version),
            integration_id: self.integration_id,
            provider: serde_json::from_str(&format!("\"{}\"", self.provider))
                .context("Failed to decode provider kind")?,
            source: SourceKind::parse(&self.source)
                .context("Failed to decode queue source kind")?,
            source_id: self.source_id,
            priority: self.priority,
            status: QueueStatus::parse(&self.status).context("Failed to decode queue status")?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            next_retry_at: self.next_retry_at,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn enum_str(provider: &EmailProviderKind) -> Result<String> {
    Ok(serde_json::to_string(provider)?.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_first_attempt_within_minute() {
        for _ in 0..50 {
            let delay = backoff_with_jitter(1).num_seconds();
            assert!((30..=60).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..50 {
            let second = backoff_with_jitter(2).num_seconds();
            assert!((60..=120).contains(&second), "delay {second} out of range");

            let deep = backoff_with_jitter(30).num_seconds();
            assert!((1800..=3600).contains(&deep), "delay {deep} out of range");
        }
    }

    #[test]
    fn test_backoff_handles_zero_attempts() {
        let delay = backoff_with_jitter(0).num_seconds();
        assert!((30..=60).contains(&delay));
    }
}
