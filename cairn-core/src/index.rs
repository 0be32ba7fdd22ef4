//! Secondary index queries used by listing and replica reconciliation.
//!
//! `LocalIndex` answers them by scanning the key/value namespaces directly,
//! which is enough for a single node and for tests. A deployment with a real
//! view engine plugs in its own `MetadataIndex`.

use crate::Result;
use crate::storage::kv::DynKvStore;
use crate::storage::{BlobOwnership, DocKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const SCAN_PAGE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthStats {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl LengthStats {
    fn single(length: u64) -> Self {
        Self {
            count: 1,
            sum: length,
            min: length,
            max: length,
        }
    }

    fn merge(&mut self, length: u64) {
        self.count += 1;
        self.sum += length;
        self.min = self.min.min(length);
        self.max = self.max.max(length);
    }
}

/// One group of files sharing the first `group_level` path components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseRow {
    pub key: Vec<String>,
    pub stats: LengthStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaCountRow {
    pub oid: String,
    pub length: u64,
    pub replicas: usize,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Files under `prefix`, grouped by their first `group_level` components.
    async fn browse(&self, prefix: &[String], group_level: usize) -> Result<Vec<BrowseRow>>;

    /// Blobs with fewer than `target` owners, fewest owners first.
    async fn under_replicated(&self, target: usize, limit: usize) -> Result<Vec<ReplicaCountRow>>;
}

pub type DynMetadataIndex = Arc<dyn MetadataIndex>;

#[derive(Deserialize)]
struct IndexedFile {
    #[serde(rename = "type")]
    kind: DocKind,
    length: u64,
}

pub struct LocalIndex {
    files: DynKvStore,
    blobs: DynKvStore,
}

impl LocalIndex {
    pub fn new(files: DynKvStore, blobs: DynKvStore) -> Self {
        Self { files, blobs }
    }
}

#[async_trait]
impl MetadataIndex for LocalIndex {
    async fn browse(&self, prefix: &[String], group_level: usize) -> Result<Vec<BrowseRow>> {
        let prefix_path = prefix.join("/");
        // '0' sorts right after '/', so every key under the prefix is below it
        let (mut after, lower, upper) = if prefix_path.is_empty() {
            (None, String::new(), None)
        } else {
            (
                Some(prefix_path.clone()),
                format!("{}/", prefix_path),
                Some(format!("{}0", prefix_path)),
            )
        };

        let mut groups: BTreeMap<Vec<String>, LengthStats> = BTreeMap::new();
        'scan: loop {
            let page = self.files.scan(after.as_deref(), SCAN_PAGE).await?;
            let Some((last_key, _)) = page.last() else {
                break;
            };
            let next_after = last_key.clone();

            for (key, entry) in page {
                if let Some(upper) = &upper {
                    if key.as_str() >= upper.as_str() {
                        break 'scan;
                    }
                }
                if !key.starts_with(&lower) {
                    continue;
                }

                let Ok(file) = serde_json::from_slice::<IndexedFile>(&entry.value) else {
                    continue;
                };
                if file.kind != DocKind::File {
                    continue;
                }

                let group: Vec<String> = key
                    .split('/')
                    .take(group_level)
                    .map(str::to_string)
                    .collect();
                groups
                    .entry(group)
                    .and_modify(|stats| stats.merge(file.length))
                    .or_insert_with(|| LengthStats::single(file.length));
            }

            after = Some(next_after);
        }

        Ok(groups
            .into_iter()
            .map(|(key, stats)| BrowseRow { key, stats })
            .collect())
    }

    async fn under_replicated(&self, target: usize, limit: usize) -> Result<Vec<ReplicaCountRow>> {
        let mut rows = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page = self.blobs.scan(after.as_deref(), SCAN_PAGE).await?;
            let Some((last_key, _)) = page.last() else {
                break;
            };
            after = Some(last_key.clone());

            for (_, entry) in page {
                let Some(record) = BlobOwnership::decode(&entry.value) else {
                    continue;
                };
                if record.replica_count() < target {
                    rows.push(ReplicaCountRow {
                        replicas: record.replica_count(),
                        oid: record.oid,
                        length: record.length,
                    });
                }
            }
        }

        rows.sort_by(|a, b| a.replicas.cmp(&b.replicas).then_with(|| a.oid.cmp(&b.oid)));
        rows.truncate(limit);
        Ok(rows)
    }
}
