//! Templates Repository
//!
//! Versioned storage: (id, version) is the key, saving a template with a
//! bumped version leaves history intact. Broadcasts and messages reference
//! (id, version) pairs, never template bodies.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{FromRow, PgPool};

use mailtide_models::{Channel, Template, TemplateReference};

pub struct TemplatesRepository {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct TemplateRow {
    id: String,
    version: i32,
    name: String,
    channel: String,
    category: String,
    email_payload: Option<serde_json::Value>,
    web_payload: Option<serde_json::Value>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<TemplateRow> for Template {
    type Error = anyhow::Error;

    fn try_from(row: TemplateRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            version: row.version,
            name: row.name,
            channel: serde_json::from_str(&format!("\"{}\"", row.channel))
                .context("Unknown template channel")?,
            category: row.category,
            email: row
                .email_payload
                .map(serde_json::from_value)
                .transpose()
                .context("Failed to decode email payload")?,
            web: row
                .web_payload
                .map(serde_json::from_value)
                .transpose()
                .context("Failed to decode web payload")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TemplatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, reference: &TemplateReference) -> Result<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT id, version, name, channel, category, email_payload, web_payload,
                   created_at, updated_at
            FROM templates
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(&reference.id)
        .bind(reference.version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch template")?;

        row.map(Template::try_from).transpose()
    }

    pub async fn find_latest(&self, id: &str) -> Result<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT id, version, name, channel, category, email_payload, web_payload,
                   created_at, updated_at
            FROM templates
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest template version")?;

        row.map(Template::try_from).transpose()
    }

    /// Persist a template version. Saving an existing (id, version) is an
    /// update; new versions append to history.
    pub async fn save(&self, template: &Template) -> Result<()> {
        template.validate().context("Template failed validation")?;

        let channel = match template.channel {
            Channel::Email => "email",
            Channel::Web => "web",
        };
        let email_payload = template.email.as_ref().map(serde_json::to_value).transpose()?;
        let web_payload = template.web.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO templates
                (id, version, name, channel, category, email_payload, web_payload,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (id, version) DO UPDATE
            SET name = EXCLUDED.name, category = EXCLUDED.category,
                email_payload = EXCLUDED.email_payload, web_payload = EXCLUDED.web_payload,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&template.id)
        .bind(template.version)
        .bind(&template.name)
        .bind(channel)
        .bind(&template.category)
        .bind(&email_payload)
        .bind(&web_payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to save template")?;

        Ok(())
    }

    pub async fn versions(&self, id: &str) -> Result<Vec<i32>> {
        let rows: Vec<(i32,)> =
            sqlx::query_as("SELECT version FROM templates WHERE id = $1 ORDER BY version ASC")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list template versions")?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }
}
