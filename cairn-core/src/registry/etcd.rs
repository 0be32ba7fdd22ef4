use super::Registry;
use crate::{NodeInfo, Result};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions};
use tokio::sync::Mutex;

const NODE_LEASE_TTL_SECS: i64 = 60;

/// Node entries under `/<namespace>/nodes/<node_id>`, each bound to a lease so
/// a node that stops heartbeating disappears on its own.
pub struct EtcdRegistry {
    client: Mutex<Client>,
    prefix: String,
}

impl EtcdRegistry {
    pub async fn new(endpoints: &[String], namespace: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Mutex::new(client),
            prefix: format!("/{}/nodes/", namespace.trim_matches('/')),
        })
    }

    fn node_key(&self, node_id: &str) -> String {
        format!("{}{}", self.prefix, node_id)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        let payload = serde_json::to_vec(node)?;
        let mut client = self.client.lock().await;

        let lease = client.lease_grant(NODE_LEASE_TTL_SECS, None).await?;
        client
            .put(
                self.node_key(&node.node_id),
                payload,
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await?;
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut client = self.client.lock().await;
        let response = client
            .get(self.prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut nodes = Vec::new();
        for kv in response.kvs() {
            match serde_json::from_slice::<NodeInfo>(kv.value()) {
                Ok(node) => nodes.push(node),
                Err(error) => {
                    tracing::warn!(
                        "ignoring malformed node entry {}: {}",
                        String::from_utf8_lossy(kv.key()),
                        error
                    );
                }
            }
        }
        Ok(nodes)
    }
}
