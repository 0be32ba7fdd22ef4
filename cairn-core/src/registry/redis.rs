use super::Registry;
use crate::{CairnError, NodeInfo, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;

/// Node entries kept as JSON values in the hash `<namespace>:nodes`.
pub struct RedisRegistry {
    conn: ConnectionManager,
    nodes_key: String,
}

impl RedisRegistry {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            CairnError::Config(format!("redis registry connection config error: {}", error))
        })?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            nodes_key: format!("{}:nodes", namespace),
        })
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        let payload = serde_json::to_string(node)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.nodes_key, &node.node_id, payload).await?;
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.nodes_key).await?;

        let mut nodes = Vec::with_capacity(raw.len());
        for (node_id, payload) in raw {
            match serde_json::from_str::<NodeInfo>(&payload) {
                Ok(node) => nodes.push(node),
                Err(error) => {
                    tracing::warn!("ignoring malformed node entry {}: {}", node_id, error);
                }
            }
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }
}
