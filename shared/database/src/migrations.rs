use anyhow::Result;
use sqlx::PgPool;

/// Master database: tenants, their integrations and operator alerts.
pub async fn run_master_migrations(pool: &PgPool) -> Result<()> {
    tracing::info!("Running master database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workspaces (
            id VARCHAR(32) PRIMARY KEY,
            name VARCHAR NOT NULL,
            settings JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integrations (
            id VARCHAR PRIMARY KEY,
            workspace_id VARCHAR(32) NOT NULL REFERENCES workspaces(id),
            name VARCHAR NOT NULL,
            kind VARCHAR NOT NULL,
            email_settings JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operator_alerts (
            id BIGSERIAL PRIMARY KEY,
            workspace_id VARCHAR(32) NOT NULL,
            integration_id VARCHAR NOT NULL,
            kind VARCHAR NOT NULL,
            message TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            resolved_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-workspace database: contacts, audiences, templates, broadcasts, the
/// send queue and the engagement timeline.
pub async fn run_workspace_migrations(pool: &PgPool) -> Result<()> {
    tracing::info!("Running workspace database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            email VARCHAR PRIMARY KEY,
            external_id VARCHAR,
            timezone VARCHAR,
            language VARCHAR,
            first_name VARCHAR,
            last_name VARCHAR,
            phone VARCHAR,
            address_line_1 VARCHAR,
            address_line_2 VARCHAR,
            country VARCHAR,
            postcode VARCHAR,
            state VARCHAR,
            job_title VARCHAR,
            custom_string_1 VARCHAR, custom_string_2 VARCHAR, custom_string_3 VARCHAR,
            custom_string_4 VARCHAR, custom_string_5 VARCHAR,
            custom_number_1 DOUBLE PRECISION, custom_number_2 DOUBLE PRECISION,
            custom_number_3 DOUBLE PRECISION, custom_number_4 DOUBLE PRECISION,
            custom_number_5 DOUBLE PRECISION,
            custom_datetime_1 TIMESTAMPTZ, custom_datetime_2 TIMESTAMPTZ,
            custom_datetime_3 TIMESTAMPTZ, custom_datetime_4 TIMESTAMPTZ,
            custom_datetime_5 TIMESTAMPTZ,
            custom_json_1 JSONB, custom_json_2 JSONB, custom_json_3 JSONB,
            custom_json_4 JSONB, custom_json_5 JSONB,
            deliverability_flagged BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lists (
            id VARCHAR PRIMARY KEY,
            name VARCHAR NOT NULL,
            is_double_optin BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS list_memberships (
            contact_email VARCHAR NOT NULL REFERENCES contacts(email),
            list_id VARCHAR NOT NULL REFERENCES lists(id),
            status VARCHAR NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (contact_email, list_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id VARCHAR PRIMARY KEY,
            name VARCHAR NOT NULL,
            predicate JSONB NOT NULL,
            refreshed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segment_memberships (
            segment_id VARCHAR NOT NULL REFERENCES segments(id),
            contact_email VARCHAR NOT NULL REFERENCES contacts(email),
            PRIMARY KEY (segment_id, contact_email)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS templates (
            id VARCHAR NOT NULL,
            version INTEGER NOT NULL,
            name VARCHAR NOT NULL,
            channel VARCHAR NOT NULL,
            category VARCHAR NOT NULL,
            email_payload JSONB,
            web_payload JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broadcasts (
            id VARCHAR PRIMARY KEY,
            name VARCHAR NOT NULL,
            status VARCHAR NOT NULL DEFAULT 'draft',
            integration_id VARCHAR NOT NULL,
            audience JSONB NOT NULL,
            schedule JSONB NOT NULL,
            variations JSONB NOT NULL,
            ab_test JSONB,
            test_recipient_count BIGINT NOT NULL DEFAULT 0,
            winner_recipient_count BIGINT NOT NULL DEFAULT 0,
            total_recipient_count BIGINT NOT NULL DEFAULT 0,
            last_cursor VARCHAR,
            winner_template JSONB,
            test_ends_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_queue (
            id BIGSERIAL PRIMARY KEY,
            message_id VARCHAR NOT NULL,
            contact_email VARCHAR NOT NULL,
            template_id VARCHAR NOT NULL,
            template_version INTEGER NOT NULL,
            integration_id VARCHAR NOT NULL,
            provider VARCHAR NOT NULL,
            source VARCHAR NOT NULL,
            source_id VARCHAR NOT NULL,
            priority INTEGER NOT NULL DEFAULT 10,
            status VARCHAR NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            next_retry_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            claimed_by VARCHAR,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (integration_id, message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS email_queue_claim_idx
        ON email_queue (status, next_retry_at, priority, created_at, id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_history (
            message_id VARCHAR PRIMARY KEY,
            channel VARCHAR NOT NULL DEFAULT 'email',
            contact_email VARCHAR NOT NULL,
            template_id VARCHAR NOT NULL,
            template_version INTEGER NOT NULL,
            broadcast_id VARCHAR,
            automation_id VARCHAR,
            external_id VARCHAR,
            sent_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            bounced_at TIMESTAMPTZ,
            complained_at TIMESTAMPTZ,
            opened_at TIMESTAMPTZ,
            clicked_at TIMESTAMPTZ,
            unsubscribed_at TIMESTAMPTZ,
            failed_at TIMESTAMPTZ,
            open_count INTEGER NOT NULL DEFAULT 0,
            click_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS message_history_broadcast_idx
        ON message_history (broadcast_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS message_history_contact_idx
        ON message_history (contact_email, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id BIGSERIAL PRIMARY KEY,
            integration_id VARCHAR NOT NULL,
            provider VARCHAR NOT NULL,
            payload JSONB NOT NULL,
            events_recorded INTEGER NOT NULL DEFAULT 0,
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS automation_node_executions (
            id BIGSERIAL PRIMARY KEY,
            automation_id VARCHAR NOT NULL,
            node_id VARCHAR NOT NULL,
            contact_email VARCHAR NOT NULL,
            status VARCHAR NOT NULL,
            executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
