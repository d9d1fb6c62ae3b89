//! Command audit persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use swarm_protocol::{CommandPayload, CommandResultPayload};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub command_id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub target: String,
    pub args: String,
    pub issued_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandAuditRepository {
    pool: SqlitePool,
}

impl CommandAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a freshly issued command as pending. Returns false when the
    /// command id already has an audit row.
    pub async fn try_insert_pending(&self, command: &CommandPayload) -> Result<bool> {
        let target = serde_json::to_string(&command.target).unwrap_or_else(|_| "{}".to_string());
        let args = serde_json::to_string(&command.args).unwrap_or_else(|_| "{}".to_string());

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO commands_audit (command_id, type, target, args, issued_at, status)
            VALUES (?, ?, ?, ?, ?, 'pending')
            "#,
        )
        .bind(&command.command_id)
        .bind(command.kind.to_string())
        .bind(target)
        .bind(args)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("inserting command audit row")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_finished(
        &self,
        command_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE commands_audit SET finished_at = ?, status = ?, error = ? WHERE command_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status)
        .bind(error)
        .bind(command_id)
        .execute(&self.pool)
        .await
        .context("finishing command audit row")?;

        Ok(())
    }

    /// Persist a result that arrived after its waiter gave up. The row is
    /// updated in place; a result for a command this store never issued
    /// gets a minimal row so the audit trail stays complete.
    pub async fn record_late(&self, result: &CommandResultPayload) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE commands_audit SET finished_at = ?, status = ?, error = ? WHERE command_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(result.status.to_string())
        .bind(&result.error)
        .bind(&result.command_id)
        .execute(&self.pool)
        .await
        .context("recording late result")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO commands_audit
                    (command_id, type, target, args, issued_at, finished_at, status, error)
                VALUES (?, 'unknown', '{}', '{}', ?, ?, ?, ?)
                "#,
            )
            .bind(&result.command_id)
            .bind(Utc::now().to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(result.status.to_string())
            .bind(&result.error)
            .execute(&self.pool)
            .await
            .context("inserting late result row")?;
        }

        Ok(())
    }

    pub async fn get(&self, command_id: &str) -> Result<Option<AuditRow>> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT command_id, type, target, args, issued_at, finished_at, status, error
            FROM commands_audit
            WHERE command_id = ?
            "#,
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching command audit row")?;

        Ok(row)
    }

    pub async fn list(&self) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT command_id, type, target, args, issued_at, finished_at, status, error
            FROM commands_audit
            ORDER BY issued_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing command audit rows")?;

        Ok(rows)
    }
}
