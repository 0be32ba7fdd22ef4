use super::Registry;
use crate::{NodeInfo, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Membership from configuration. Configured peers have no heartbeat of their
/// own and are reported as alive; nodes that register themselves keep the
/// heartbeat they were registered with.
pub struct StaticRegistry {
    peers: Vec<NodeInfo>,
    registered: RwLock<BTreeMap<String, NodeInfo>>,
}

impl StaticRegistry {
    pub fn new(peers: Vec<NodeInfo>) -> Self {
        Self {
            peers,
            registered: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        self.registered
            .write()
            .await
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let now = Utc::now();
        let mut nodes: BTreeMap<String, NodeInfo> = self
            .peers
            .iter()
            .map(|peer| {
                let mut peer = peer.clone();
                peer.heartbeat_at = now;
                (peer.node_id.clone(), peer)
            })
            .collect();

        for (node_id, node) in self.registered.read().await.iter() {
            nodes.insert(node_id.clone(), node.clone());
        }

        Ok(nodes.into_values().collect())
    }
}
