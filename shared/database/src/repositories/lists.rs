//! Lists Repository
//!
//! Lists and memberships. Membership status transitions are the write side
//! of bounce/complaint/unsubscribe handling.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{FromRow, PgPool};

use mailtide_models::{List, ListMembership, MembershipStatus};
use mailtide_utils::validation::normalize_email;

pub struct ListsRepository {
    pool: PgPool,
}

impl ListsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<List>> {
        let list: Option<List> = sqlx::query_as(
            "SELECT id, name, is_double_optin, created_at, updated_at FROM lists WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch list")?;

        Ok(list)
    }

    pub async fn create(&self, list: &List) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lists (id, name, is_double_optin, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, is_double_optin = EXCLUDED.is_double_optin,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&list.id)
        .bind(&list.name)
        .bind(list.is_double_optin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to create list")?;
        Ok(())
    }

    /// Subscribe a contact; double-opt-in lists start pending.
    pub async fn subscribe(&self, email: &str, list_id: &str) -> Result<ListMembership> {
        let list = self
            .find_by_id(list_id)
            .await?
            .context("List not found")?;
        let status = if list.is_double_optin {
            MembershipStatus::Pending
        } else {
            MembershipStatus::Active
        };

        let row: MembershipRow = sqlx::query_as(
            r#"
            INSERT INTO list_memberships (contact_email, list_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (contact_email, list_id) DO UPDATE
            SET updated_at = EXCLUDED.updated_at
            RETURNING contact_email, list_id, status, created_at, updated_at
            "#,
        )
        .bind(normalize_email(email))
        .bind(list_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to subscribe contact")?;

        ListMembership::try_from(row)
    }

    pub async fn membership(
        &self,
        email: &str,
        list_id: &str,
    ) -> Result<Option<ListMembership>> {
        let row: Option<MembershipRow> = sqlx::query_as(
            r#"
            SELECT contact_email, list_id, status, created_at, updated_at
            FROM list_memberships
            WHERE contact_email = $1 AND list_id = $2
            "#,
        )
        .bind(normalize_email(email))
        .bind(list_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch membership")?;

        row.map(ListMembership::try_from).transpose()
    }

    /// Move a single membership to a new status.
    pub async fn update_status(
        &self,
        email: &str,
        list_id: &str,
        status: MembershipStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE list_memberships
            SET status = $3, updated_at = $4
            WHERE contact_email = $1 AND list_id = $2
            "#,
        )
        .bind(normalize_email(email))
        .bind(list_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to update membership status")?;

        Ok(result.rows_affected() > 0)
    }

    /// Move every membership of a contact to a new status (bounce and
    /// complaint handling applies list-wide). Returns affected lists.
    pub async fn update_status_all_lists(
        &self,
        email: &str,
        status: MembershipStatus,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE list_memberships
            SET status = $2, updated_at = $3
            WHERE contact_email = $1
              AND status NOT IN ('unsubscribed', 'complained')
            RETURNING list_id
            "#,
        )
        .bind(normalize_email(email))
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .context("Failed to update memberships")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// How many lists hold this contact with the given status.
    pub async fn count_with_status(
        &self,
        email: &str,
        status: MembershipStatus,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM list_memberships WHERE contact_email = $1 AND status = $2",
        )
        .bind(normalize_email(email))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count memberships")?;
        Ok(count)
    }
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    contact_email: String,
    list_id: String,
    status: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<MembershipRow> for ListMembership {
    type Error = anyhow::Error;

    fn try_from(row: MembershipRow) -> Result<Self> {
        Ok(Self {
            contact_email: row.contact_email,
            list_id: row.list_id,
            status: MembershipStatus::parse(&row.status)
                .context("Unknown membership status in row")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
