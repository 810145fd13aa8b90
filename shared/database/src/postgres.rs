use anyhow::Result;
use sqlx::{Executor, Pool, Postgres};
use std::time::Duration;

use mailtide_utils::config::DatabaseConfig;

pub type PostgresPool = Pool<Postgres>;

pub async fn create_postgres_pool(database_url: &str, config: &DatabaseConfig) -> Result<PostgresPool> {
    let statement_timeout_ms = config.statement_timeout_seconds * 1000;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::info!("Connected to PostgreSQL database");
    Ok(pool)
}

pub async fn health_check(pool: &PostgresPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
