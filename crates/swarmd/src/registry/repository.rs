//! Node persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Node, NodeStatus};

/// Raw node row; timestamps stay strings so one bad row cannot poison a
/// whole load.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub hostname: String,
    pub status: String,
    pub last_heartbeat: String,
    pub connected_at: String,
}

#[derive(Debug, Clone)]
pub struct NodeRepository {
    pool: SqlitePool,
}

impl NodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, node: &Node) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, hostname, status, last_heartbeat, connected_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                connected_at = excluded.connected_at
            "#,
        )
        .bind(&node.node_id)
        .bind(&node.hostname)
        .bind(node.status.to_string())
        .bind(node.last_heartbeat.to_rfc3339())
        .bind(node.connected_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting node")?;

        Ok(())
    }

    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        sqlx::query("UPDATE nodes SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("updating node status")?;

        Ok(())
    }

    pub async fn set_heartbeat(&self, node_id: &str, at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        sqlx::query("UPDATE nodes SET last_heartbeat = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("updating node heartbeat")?;

        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, hostname, status, last_heartbeat, connected_at FROM nodes",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading nodes")?;

        Ok(rows)
    }

    pub async fn delete(&self, node_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("deleting node")?;

        Ok(())
    }
}
