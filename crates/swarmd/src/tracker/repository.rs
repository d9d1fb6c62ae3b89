//! Session persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{SessionStatus, TrackedSession};

/// Raw session row with string timestamps; decoding happens in the
/// tracker so corrupt rows can be skipped individually.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub node_id: String,
    pub project: String,
    pub status: String,
    pub tokens: i64,
    pub cost: f64,
    pub started_at: String,
    pub last_activity: String,
}

#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, session: &TrackedSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, node_id, project, status, tokens, cost, started_at, last_activity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                project = excluded.project,
                status = excluded.status,
                tokens = excluded.tokens,
                cost = excluded.cost,
                last_activity = excluded.last_activity
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.node_id)
        .bind(&session.project)
        .bind(session.status.to_string())
        .bind(session.tokens as i64)
        .bind(session.cost)
        .bind(session.started_at.to_rfc3339())
        .bind(session.last_activity.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting session")?;

        Ok(())
    }

    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    pub async fn mark_node_sessions(&self, node_id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE node_id = ?")
            .bind(status.to_string())
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("updating node sessions")?;

        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, node_id, project, status, tokens, cost, started_at, last_activity
            FROM sessions
            ORDER BY started_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading sessions")?;

        Ok(rows)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }
}
