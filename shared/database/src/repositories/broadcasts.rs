//! Broadcasts Repository
//!
//! Status transitions run under `SELECT … FOR UPDATE` and are validated
//! against the broadcast state machine, so concurrent orchestrators and
//! operator actions cannot race a broadcast into an illegal state. The
//! audience cursor is persisted after every enqueued batch for crash
//! resume.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use mailtide_models::{Broadcast, BroadcastStatus, TemplateReference};

pub struct BroadcastsRepository {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct BroadcastRow {
    id: String,
    name: String,
    status: String,
    integration_id: String,
    audience: serde_json::Value,
    schedule: serde_json::Value,
    variations: serde_json::Value,
    ab_test: Option<serde_json::Value>,
    test_recipient_count: i64,
    winner_recipient_count: i64,
    total_recipient_count: i64,
    last_cursor: Option<String>,
    winner_template: Option<serde_json::Value>,
    test_ends_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BroadcastRow> for Broadcast {
    type Error = anyhow::Error;

    fn try_from(row: BroadcastRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            status: BroadcastStatus::parse(&row.status).context("Unknown broadcast status")?,
            integration_id: row.integration_id,
            audience: serde_json::from_value(row.audience)
                .context("Failed to decode audience settings")?,
            schedule: serde_json::from_value(row.schedule)
                .context("Failed to decode schedule")?,
            variations: serde_json::from_value(row.variations)
                .context("Failed to decode variations")?,
            ab_test: row
                .ab_test
                .map(serde_json::from_value)
                .transpose()
                .context("Failed to decode A/B settings")?,
            test_recipient_count: row.test_recipient_count,
            winner_recipient_count: row.winner_recipient_count,
            total_recipient_count: row.total_recipient_count,
            last_cursor: row.last_cursor,
            winner_template: row
                .winner_template
                .map(serde_json::from_value)
                .transpose()
                .context("Failed to decode winner template")?,
            test_ends_at: row.test_ends_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"id, name, status, integration_id, audience, schedule,
       variations, ab_test, test_recipient_count, winner_recipient_count,
       total_recipient_count, last_cursor, winner_template, test_ends_at,
       created_at, updated_at"#;

impl BroadcastsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Broadcast>> {
        let row: Option<BroadcastRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM broadcasts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch broadcast")?;

        row.map(Broadcast::try_from).transpose()
    }

    /// Broadcasts whose schedule is due and whose status still needs the
    /// orchestrator: scheduled, or mid-flight after a crash.
    pub async fn find_runnable(&self, now: DateTime<Utc>) -> Result<Vec<Broadcast>> {
        let rows: Vec<BroadcastRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM broadcasts
            WHERE status IN ('scheduled', 'testing', 'test_completed', 'winner_selected', 'sending')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch runnable broadcasts")?;

        let mut broadcasts = Vec::with_capacity(rows.len());
        for row in rows {
            let broadcast = Broadcast::try_from(row)?;
            let due = match broadcast.status {
                BroadcastStatus::Scheduled => broadcast.schedule.is_due(now),
                _ => true,
            };
            if due {
                broadcasts.push(broadcast);
            }
        }
        Ok(broadcasts)
    }

    /// Create a broadcast in draft.
    pub async fn create(&self, broadcast: &Broadcast) -> Result<()> {
        broadcast.validate()?;

        sqlx::query(
            r#"
            INSERT INTO broadcasts
                (id, name, status, integration_id, audience, schedule, variations, ab_test,
                 test_recipient_count, winner_recipient_count, total_recipient_count,
                 last_cursor, winner_template, test_ends_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
            "#,
        )
        .bind(&broadcast.id)
        .bind(&broadcast.name)
        .bind(broadcast.status.as_str())
        .bind(&broadcast.integration_id)
        .bind(serde_json::to_value(&broadcast.audience)?)
        .bind(serde_json::to_value(&broadcast.schedule)?)
        .bind(serde_json::to_value(&broadcast.variations)?)
        .bind(broadcast.ab_test.as_ref().map(serde_json::to_value).transpose()?)
        .bind(broadcast.test_recipient_count)
        .bind(broadcast.winner_recipient_count)
        .bind(broadcast.total_recipient_count)
        .bind(&broadcast.last_cursor)
        .bind(broadcast.winner_template.as_ref().map(serde_json::to_value).transpose()?)
        .bind(broadcast.test_ends_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to create broadcast")?;

        Ok(())
    }

    /// Replace the definition of an editable broadcast. A broadcast that
    /// left draft/scheduled is immutable.
    pub async fn update_definition(&self, broadcast: &Broadcast) -> Result<()> {
        broadcast.validate()?;

        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM broadcasts WHERE id = $1 FOR UPDATE")
                .bind(&broadcast.id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to lock broadcast")?;

        let Some((status,)) = current else {
            bail!("broadcast {} not found", broadcast.id);
        };
        let status = BroadcastStatus::parse(&status).context("Unknown broadcast status")?;
        if !matches!(status, BroadcastStatus::Draft | BroadcastStatus::Scheduled) {
            bail!("broadcast {} is {status} and can no longer be edited", broadcast.id);
        }

        sqlx::query(
            r#"
            UPDATE broadcasts
            SET name = $2, audience = $3, schedule = $4, variations = $5, ab_test = $6,
                integration_id = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(&broadcast.id)
        .bind(&broadcast.name)
        .bind(serde_json::to_value(&broadcast.audience)?)
        .bind(serde_json::to_value(&broadcast.schedule)?)
        .bind(serde_json::to_value(&broadcast.variations)?)
        .bind(broadcast.ab_test.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&broadcast.integration_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("Failed to update broadcast")?;

        tx.commit().await.context("Failed to commit broadcast update")?;
        Ok(())
    }

    /// Transition the status under a row lock, enforcing the state
    /// machine. Returns the broadcast as stored after the transition.
    pub async fn transition(&self, id: &str, target: BroadcastStatus) -> Result<Broadcast> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let row: Option<BroadcastRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM broadcasts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock broadcast")?;

        let Some(row) = row else {
            bail!("broadcast {id} not found");
        };
        let mut broadcast = Broadcast::try_from(row)?;

        if broadcast.status == target {
            tx.commit().await.ok();
            return Ok(broadcast);
        }
        if !broadcast.status.can_transition_to(target) {
            bail!(
                "invalid broadcast transition from {} to {}",
                broadcast.status,
                target
            );
        }

        sqlx::query("UPDATE broadcasts SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(target.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .context("Failed to transition broadcast")?;

        tx.commit().await.context("Failed to commit transition")?;

        tracing::info!(broadcast_id = id, from = %broadcast.status, to = %target, "broadcast transitioned");
        broadcast.status = target;
        Ok(broadcast)
    }

    /// Persist the audience cursor after an enqueued batch.
    pub async fn update_cursor(&self, id: &str, cursor: &str, enqueued: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE broadcasts
            SET last_cursor = $2,
                total_recipient_count = total_recipient_count + $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(cursor)
        .bind(enqueued)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to update broadcast cursor")?;
        Ok(())
    }

    /// Reset the cursor between phases (the sending phase sweeps the
    /// audience from the start; already-sent recipients dedup away).
    pub async fn reset_cursor(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE broadcasts SET last_cursor = NULL, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to reset broadcast cursor")?;
        Ok(())
    }

    /// Freeze the test-phase recipient count once the test enqueue is done.
    pub async fn set_test_count(&self, id: &str, test_recipients: i64) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts SET test_recipient_count = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(test_recipients)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to set test recipient count")?;
        Ok(())
    }

    pub async fn set_test_ends_at(&self, id: &str, ends_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE broadcasts SET test_ends_at = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(ends_at)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to set test end time")?;
        Ok(())
    }

    pub async fn set_winner(&self, id: &str, winner: &TemplateReference) -> Result<()> {
        sqlx::query("UPDATE broadcasts SET winner_template = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(winner)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to set broadcast winner")?;
        Ok(())
    }
}
