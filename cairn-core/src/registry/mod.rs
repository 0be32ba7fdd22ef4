pub mod etcd;
pub mod factory;
pub mod fixed;
pub mod redis;

pub use factory::{RegistryBuilder, RegistryKind};

use crate::{NodeInfo, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Source of truth for cluster membership.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Inserts or refreshes this node's entry.
    async fn register_node(&self, node: &NodeInfo) -> Result<()>;

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>>;
}

pub type DynRegistry = Arc<dyn Registry>;

/// Live peers of `local_node_id`, sorted by node id.
pub async fn list_remote_nodes(
    registry: &dyn Registry,
    local_node_id: &str,
    stale_after: Duration,
) -> Result<Vec<NodeInfo>> {
    let now = Utc::now();
    let mut nodes: Vec<NodeInfo> = registry
        .get_nodes()
        .await?
        .into_iter()
        .filter(|node| node.node_id != local_node_id)
        .filter(|node| {
            let stale = node.is_stale(stale_after, now);
            if stale {
                tracing::debug!(
                    "skipping stale node {} (last heartbeat {})",
                    node.node_id,
                    node.heartbeat_at
                );
            }
            !stale
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Ok(nodes)
}
