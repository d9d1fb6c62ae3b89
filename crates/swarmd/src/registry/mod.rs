//! Node registry: the authoritative in-memory index of agents, persisted
//! write-through and crash-recovered with per-row fault tolerance.

mod models;
mod repository;

pub use models::{Node, NodeStatus};
pub use repository::{NodeRepository, NodeRow};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct NodeRegistry {
    repo: NodeRepository,
    nodes: RwLock<HashMap<String, Node>>,
    recovery_errors: AtomicU64,
}

impl NodeRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repo: NodeRepository::new(pool),
            nodes: RwLock::new(HashMap::new()),
            recovery_errors: AtomicU64::new(0),
        }
    }

    /// Load persisted nodes. Rows with an unknown status or an
    /// unparseable timestamp are skipped and counted; the load succeeds as
    /// long as the table itself is readable. Every recovered node starts
    /// offline because no connection survives a restart.
    pub async fn load_from_db(&self) -> Result<()> {
        let rows = self.repo.load_all().await?;
        let mut loaded = 0usize;

        for row in rows {
            let node = match decode_row(&row) {
                Ok(node) => node,
                Err(err) => {
                    warn!("skipping corrupt node row {}: {}", row.id, err);
                    self.recovery_errors.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            };

            let mut node = node;
            node.status = NodeStatus::Offline;
            self.repo.set_status(&node.node_id, NodeStatus::Offline).await?;
            self.nodes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(node.node_id.clone(), node);
            loaded += 1;
        }

        info!(
            "node registry recovered {} nodes ({} corrupt rows skipped)",
            loaded,
            self.recovery_errors.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub fn recovery_error_count(&self) -> u64 {
        self.recovery_errors.load(Ordering::SeqCst)
    }

    /// Upsert a node as online. Called on every accepted connection and
    /// again when the register snapshot arrives with the hostname.
    pub async fn register(
        &self,
        node_id: &str,
        hostname: &str,
        projects: &[String],
    ) -> Result<()> {
        let now = Utc::now();
        let node = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let node = nodes
                .entry(node_id.to_string())
                .or_insert_with(|| Node {
                    node_id: node_id.to_string(),
                    hostname: hostname.to_string(),
                    projects: projects.to_vec(),
                    status: NodeStatus::Online,
                    last_heartbeat: now,
                    connected_at: now,
                });
            if !hostname.is_empty() {
                node.hostname = hostname.to_string();
            }
            if !projects.is_empty() {
                node.projects = projects.to_vec();
            }
            node.status = NodeStatus::Online;
            node.last_heartbeat = now;
            node.connected_at = now;
            node.clone()
        };

        self.repo.upsert(&node).await
    }

    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        let now = Utc::now();
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            if let Some(node) = nodes.get_mut(node_id) {
                node.last_heartbeat = now;
            } else {
                return Ok(());
            }
        }
        self.repo.set_heartbeat(node_id, now).await
    }

    pub async fn mark_offline(&self, node_id: &str) -> Result<()> {
        let known = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            match nodes.get_mut(node_id) {
                Some(node) => {
                    node.status = NodeStatus::Offline;
                    true
                }
                None => false,
            }
        };
        if known {
            self.repo.set_status(node_id, NodeStatus::Offline).await?;
        }
        Ok(())
    }

    /// Operator-initiated removal; the only path that destroys a node.
    pub async fn remove(&self, node_id: &str) -> Result<()> {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        self.repo.delete(node_id).await
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn online_nodes(&self) -> Vec<Node> {
        self.list()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .collect()
    }

    /// Deterministic target resolution: the alphabetically first online
    /// node, optionally restricted to owners of `project`.
    pub fn pick_node(&self, project: Option<&str>) -> Option<String> {
        self.online_nodes()
            .into_iter()
            .filter(|n| project.is_none_or(|p| n.owns_project(p)))
            .map(|n| n.node_id)
            .next()
    }
}

fn decode_row(row: &NodeRow) -> Result<Node, String> {
    let status: NodeStatus = row.status.parse()?;
    let last_heartbeat = parse_ts(&row.last_heartbeat)?;
    let connected_at = parse_ts(&row.connected_at)?;

    Ok(Node {
        node_id: row.id.clone(),
        hostname: row.hostname.clone(),
        projects: Vec::new(),
        status,
        last_heartbeat,
        connected_at,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {:?}: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn registry() -> NodeRegistry {
        let db = Database::in_memory().await.unwrap();
        NodeRegistry::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_register_and_pick() {
        let registry = registry().await;
        registry
            .register("node-b", "host-b", &["proj-2".to_string()])
            .await
            .unwrap();
        registry
            .register("node-a", "host-a", &["proj-1".to_string()])
            .await
            .unwrap();

        assert_eq!(registry.pick_node(None).as_deref(), Some("node-a"));
        assert_eq!(
            registry.pick_node(Some("proj-2")).as_deref(),
            Some("node-b")
        );
        assert_eq!(registry.pick_node(Some("proj-404")), None);

        registry.mark_offline("node-a").await.unwrap();
        assert_eq!(registry.pick_node(None).as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_recovery_skips_corrupt_rows() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO nodes (id, hostname, status, last_heartbeat, connected_at) VALUES \
             ('good', 'h1', 'online', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00'), \
             ('bad-ts', 'h2', 'online', 'not-a-timestamp', '2026-01-01T00:00:00+00:00'), \
             ('bad-status', 'h3', 'sideways', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let registry = NodeRegistry::new(db.pool().clone());
        registry.load_from_db().await.unwrap();

        assert_eq!(registry.recovery_error_count(), 2);
        let nodes = registry.list();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "good");
        // Recovered nodes come back offline until they reconnect.
        assert_eq!(nodes[0].status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_remove_is_permanent() {
        let registry = registry().await;
        registry.register("node-a", "h", &[]).await.unwrap();
        registry.remove("node-a").await.unwrap();
        assert!(registry.get("node-a").is_none());
    }
}
