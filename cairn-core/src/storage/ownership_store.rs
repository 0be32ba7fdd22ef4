use crate::Result;
use crate::storage::kv::{DynKvStore, update_with_retry};
use crate::storage::metadata_store::DocKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which nodes hold a copy of a blob, with the time each one recorded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobOwnership {
    #[serde(rename = "type")]
    pub kind: DocKind,
    pub oid: String,
    pub length: u64,
    #[serde(default)]
    pub nodes: BTreeMap<String, DateTime<Utc>>,
}

impl BlobOwnership {
    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<BlobOwnership>(raw) {
            Ok(record) if record.kind == DocKind::Blob => Some(record),
            _ => None,
        }
    }
}

/// Blob ownership records, keyed by oid.
#[derive(Clone)]
pub struct OwnershipStore {
    kv: DynKvStore,
}

impl OwnershipStore {
    pub fn new(kv: DynKvStore) -> Self {
        Self { kv }
    }

    /// Records `node_id` as holding `oid`, creating the record on first sight.
    pub async fn add_owner(&self, oid: &str, length: u64, node_id: &str) -> Result<BlobOwnership> {
        let raw = update_with_retry(self.kv.as_ref(), oid, |current| {
            let mut record = current
                .and_then(BlobOwnership::decode)
                .unwrap_or_else(|| BlobOwnership {
                    kind: DocKind::Blob,
                    oid: oid.to_string(),
                    length,
                    nodes: BTreeMap::new(),
                });
            record.length = length;
            record.nodes.insert(node_id.to_string(), Utc::now());
            Ok(serde_json::to_vec(&record)?)
        })
        .await?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Ownership record for `oid`, if any node has reported it.
    pub async fn get(&self, oid: &str) -> Result<Option<BlobOwnership>> {
        Ok(self
            .kv
            .get(oid)
            .await?
            .and_then(|entry| BlobOwnership::decode(&entry.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_owner_accumulates_nodes() {
        let store = OwnershipStore::new(Arc::new(MemoryKv::new()));

        store.add_owner("ab", 10, "node-a").await.unwrap();
        store.add_owner("ab", 10, "node-b").await.unwrap();
        let record = store.add_owner("ab", 10, "node-a").await.unwrap();

        assert_eq!(record.replica_count(), 2);
        assert!(record.is_owned_by("node-a"));
        assert!(record.is_owned_by("node-b"));
        assert_eq!(store.get("ab").await.unwrap(), Some(record));
        assert!(store.get("cd").await.unwrap().is_none());
    }
}
