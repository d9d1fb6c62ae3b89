//! Event persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// One persisted event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: String,
    pub node_id: String,
    pub session_id: Option<String>,
    #[sqlx(rename = "type")]
    pub kind: String,
    /// JSON text, preserved as received.
    pub data: String,
    pub timestamp: i64,
    pub seq: i64,
}

#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one event. Returns false when the id (or the node/seq pair)
    /// already exists; duplicates are silently kept as first-write-wins.
    pub async fn insert(&self, event: &StoredEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO events (id, node_id, session_id, type, data, timestamp, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.node_id)
        .bind(&event.session_id)
        .bind(&event.kind)
        .bind(&event.data)
        .bind(event.timestamp)
        .bind(event.seq)
        .execute(&self.pool)
        .await
        .context("inserting event")?;

        Ok(result.rows_affected() > 0)
    }

    /// Highest persisted seq for a node, 0 when none.
    pub async fn max_seq(&self, node_id: &str) -> Result<i64> {
        let (max,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM events WHERE node_id = ?")
                .bind(node_id)
                .fetch_one(&self.pool)
                .await
                .context("querying max seq")?;

        Ok(max)
    }

    /// Highest persisted seq per node.
    pub async fn max_seqs(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT node_id, MAX(seq) FROM events GROUP BY node_id")
                .fetch_all(&self.pool)
                .await
                .context("querying max seqs")?;

        Ok(rows)
    }

    pub async fn list_by_node(&self, node_id: &str) -> Result<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT id, node_id, session_id, type, data, timestamp, seq
            FROM events
            WHERE node_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .context("listing events by node")?;

        Ok(events)
    }

    /// Events ordered the way operators read them: by (timestamp, id).
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT id, node_id, session_id, type, data, timestamp, seq
            FROM events
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing recent events")?;

        Ok(events)
    }

    pub async fn list_by_kind(&self, kind: &str) -> Result<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT id, node_id, session_id, type, data, timestamp, seq
            FROM events
            WHERE type = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await
        .context("listing events by kind")?;

        Ok(events)
    }
}
