//! Workspace registry.
//!
//! Owns the master pool and a lazily-built pool per workspace database.
//! Loading a workspace decrypts its secret key and integration secrets
//! under the process master passphrase; saving runs the encrypt pass so
//! plaintext never reaches a row.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::FromRow;
use tokio::sync::RwLock;

use mailtide_models::{Integration, IntegrationKind, Workspace, WorkspaceSettings};
use mailtide_utils::config::DatabaseConfig;
use mailtide_utils::validation::validate_workspace_id;

use crate::migrations::{run_master_migrations, run_workspace_migrations};
use crate::postgres::{create_postgres_pool, PostgresPool};
use crate::secrets::{
    decrypt_integration_secrets, decrypt_workspace_settings, encrypt_integration_secrets,
    encrypt_workspace_settings,
};

pub struct WorkspaceRegistry {
    master: PostgresPool,
    config: DatabaseConfig,
    passphrase: String,
    pools: RwLock<HashMap<String, PostgresPool>>,
}

#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    settings: serde_json::Value,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct IntegrationRow {
    id: String,
    name: String,
    kind: String,
    email_settings: Option<serde_json::Value>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl WorkspaceRegistry {
    pub async fn connect(config: DatabaseConfig, passphrase: String) -> Result<Self> {
        let master = create_postgres_pool(&config.master_url, &config).await?;
        run_master_migrations(&master).await?;

        Ok(Self {
            master,
            config,
            passphrase,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub fn master(&self) -> &PostgresPool {
        &self.master
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// The pool of a workspace database, creating and migrating it on first
    /// use.
    pub async fn workspace_pool(&self, workspace_id: &str) -> Result<PostgresPool> {
        validate_workspace_id(workspace_id)?;

        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(workspace_id) {
                return Ok(pool.clone());
            }
        }

        let url = format!(
            "{}{}{}",
            self.config.workspace_url_prefix, self.config.workspace_db_prefix, workspace_id
        );
        let pool = create_postgres_pool(&url, &self.config).await?;
        run_workspace_migrations(&pool).await?;

        let mut pools = self.pools.write().await;
        let pool = pools.entry(workspace_id.to_string()).or_insert(pool).clone();
        Ok(pool)
    }

    /// Load a workspace with decrypted settings and integrations.
    pub async fn load_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let row: WorkspaceRow = sqlx::query_as(
            r#"
            SELECT id, name, settings, created_at, updated_at
            FROM workspaces
            WHERE id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_one(&self.master)
        .await
        .context("Failed to fetch workspace")?;

        let mut settings: WorkspaceSettings =
            serde_json::from_value(row.settings).context("Failed to decode workspace settings")?;
        decrypt_workspace_settings(&mut settings, &self.passphrase)?;

        let integration_rows: Vec<IntegrationRow> = sqlx::query_as(
            r#"
            SELECT id, name, kind, email_settings, created_at, updated_at
            FROM integrations
            WHERE workspace_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.master)
        .await
        .context("Failed to fetch workspace integrations")?;

        let mut integrations = Vec::with_capacity(integration_rows.len());
        for row in integration_rows {
            let mut integration = Integration {
                id: row.id,
                name: row.name,
                kind: serde_json::from_str(&format!("\"{}\"", row.kind))
                    .unwrap_or(IntegrationKind::Email),
                email: match row.email_settings {
                    Some(value) => {
                        Some(serde_json::from_value(value).context("Failed to decode integration")?)
                    }
                    None => None,
                },
                created_at: row.created_at,
                updated_at: row.updated_at,
            };
            decrypt_integration_secrets(&mut integration, &self.passphrase)?;
            integrations.push(integration);
        }

        Ok(Workspace {
            id: row.id,
            name: row.name,
            settings,
            integrations,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// List all workspace ids known to the master database.
    pub async fn workspace_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM workspaces ORDER BY id")
            .fetch_all(&self.master)
            .await
            .context("Failed to list workspaces")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Persist a workspace; secrets are encrypted and plaintext cleared
    /// before the settings blob is written.
    pub async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        validate_workspace_id(&workspace.id)?;

        let mut settings = workspace.settings.clone();
        encrypt_workspace_settings(&mut settings, &self.passphrase)?;
        let settings_json = serde_json::to_value(&settings)?;

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, settings, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&settings_json)
        .bind(workspace.created_at)
        .bind(Utc::now())
        .execute(&self.master)
        .await
        .context("Failed to save workspace")?;

        for integration in &workspace.integrations {
            self.save_integration(&workspace.id, integration).await?;
        }

        Ok(())
    }

    pub async fn save_integration(
        &self,
        workspace_id: &str,
        integration: &Integration,
    ) -> Result<()> {
        let mut encrypted = integration.clone();
        encrypt_integration_secrets(&mut encrypted, &self.passphrase)?;

        let kind = serde_json::to_string(&encrypted.kind)?
            .trim_matches('"')
            .to_string();
        let email_settings = encrypted
            .email
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO integrations
                (id, workspace_id, name, kind, email_settings, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, kind = EXCLUDED.kind,
                email_settings = EXCLUDED.email_settings, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&encrypted.id)
        .bind(workspace_id)
        .bind(&encrypted.name)
        .bind(&kind)
        .bind(&email_settings)
        .bind(encrypted.created_at)
        .bind(Utc::now())
        .execute(&self.master)
        .await
        .context("Failed to save integration")?;

        Ok(())
    }

    /// Persist an operator alert (auth failures and the like).
    pub async fn record_operator_alert(
        &self,
        workspace_id: &str,
        integration_id: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO operator_alerts (workspace_id, integration_id, kind, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(workspace_id)
        .bind(integration_id)
        .bind(kind)
        .bind(message)
        .execute(&self.master)
        .await
        .context("Failed to record operator alert")?;

        tracing::warn!(
            workspace_id,
            integration_id,
            kind,
            message,
            "operator alert raised"
        );
        Ok(())
    }
}
