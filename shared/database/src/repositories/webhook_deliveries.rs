//! Webhook Deliveries Repository
//!
//! Audit trail of inbound provider payloads and how many canonical events
//! each one produced.

use anyhow::{Context, Result};
use sqlx::PgPool;

pub struct WebhookDeliveriesRepository {
    pool: PgPool,
}

impl WebhookDeliveriesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        integration_id: &str,
        provider: &str,
        payload: &serde_json::Value,
        events_recorded: i32,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries (integration_id, provider, payload, events_recorded)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(integration_id)
        .bind(provider)
        .bind(payload)
        .bind(events_recorded)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record webhook delivery")?;

        Ok(id)
    }
}
