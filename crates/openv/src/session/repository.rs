//! Session record repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{SessionRecord, SessionStatus, format_timestamp};

/// All session record columns for SELECT queries.
const RECORD_COLUMNS: &str = r#"
    id, tenant_id, name, container_id, status, generation, last_activity_at, created_at
"#;

/// A reconciler correction: clear the handle of `id`, but only if the record
/// still carries the handle and generation that were observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reset {
    pub id: i64,
    pub container_id: String,
    pub generation: i64,
}

impl Reset {
    pub fn from_record(record: &SessionRecord) -> Option<Self> {
        record.container_id.as_ref().map(|handle| Self {
            id: record.id,
            container_id: handle.clone(),
            generation: record.generation,
        })
    }
}

/// Repository for session record persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an idle record without a handle.
    pub async fn create(&self, tenant_id: i64, name: &str) -> Result<SessionRecord> {
        let now = format_timestamp(Utc::now());
        let id = sqlx::query(
            r#"
            INSERT INTO session_records (tenant_id, name, container_id, status, generation, last_activity_at, created_at)
            VALUES (?, ?, NULL, ?, 0, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .bind(SessionStatus::Idle.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating session record")?
        .last_insert_rowid();

        self.get(id)
            .await?
            .context("session record vanished after insert")
    }

    pub async fn get(&self, id: i64) -> Result<Option<SessionRecord>> {
        let query = format!("SELECT {} FROM session_records WHERE id = ?", RECORD_COLUMNS);
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session record")?;

        Ok(record)
    }

    pub async fn list_for_tenant(&self, tenant_id: i64) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM session_records WHERE tenant_id = ? ORDER BY id",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .context("listing session records for tenant")?;

        Ok(records)
    }

    /// Records that currently claim a running sandbox.
    pub async fn list_with_handle(&self) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM session_records WHERE container_id IS NOT NULL ORDER BY id",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing session records with a handle")?;

        Ok(records)
    }

    /// Record a freshly started sandbox. Bumps the generation so that any
    /// correction computed against the previous handle no longer applies.
    pub async fn mark_running(&self, id: i64, handle: &str) -> Result<SessionRecord> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE session_records
            SET container_id = ?, status = ?, generation = generation + 1, last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(handle)
        .bind(SessionStatus::Running.to_string())
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("marking session record running")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("session record {} not found", id);
        }

        let query = format!("SELECT {} FROM session_records WHERE id = ?", RECORD_COLUMNS);
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("fetching running session record")?;

        tx.commit().await?;
        Ok(record)
    }

    /// Clear the handle if it is still `handle`. Returns whether a row changed.
    pub async fn clear_handle(&self, id: i64, handle: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session_records
            SET container_id = NULL, status = ?
            WHERE id = ? AND container_id = ?
            "#,
        )
        .bind(SessionStatus::Idle.to_string())
        .bind(id)
        .bind(handle)
        .execute(&self.pool)
        .await
        .context("clearing session handle")?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh `last_activity_at` to now.
    pub async fn touch_activity(&self, id: i64) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE session_records SET last_activity_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("touching session activity")?;

        tx.commit().await?;
        Ok(())
    }

    /// Apply reconciler corrections in one transaction. Returns how many
    /// records were actually reset; guarded rows that moved on are skipped.
    pub async fn apply_resets(&self, resets: &[Reset]) -> Result<usize> {
        if resets.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning reconcile transaction")?;
        let mut applied = 0usize;

        for reset in resets {
            let result = sqlx::query(
                r#"
                UPDATE session_records
                SET container_id = NULL, status = ?
                WHERE id = ? AND container_id = ? AND generation = ?
                "#,
            )
            .bind(SessionStatus::Idle.to_string())
            .bind(reset.id)
            .bind(&reset.container_id)
            .bind(reset.generation)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("resetting session record {}", reset.id))?;

            applied += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .context("committing reconcile transaction")?;
        Ok(applied)
    }

    /// Overwrite the activity timestamp. Test support for idle scenarios.
    #[cfg(test)]
    pub(crate) async fn set_last_activity(&self, id: i64, at: chrono::DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE session_records SET last_activity_at = ? WHERE id = ?")
            .bind(format_timestamp(at))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session activity")?;
        Ok(())
    }
}
