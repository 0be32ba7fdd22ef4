use crate::index::DynMetadataIndex;
use crate::registry::{DynRegistry, list_remote_nodes};
use crate::settings::SettingsHandle;
use crate::tasks::{InternodeTask, TaskDispatcher};
use crate::{
    BlobOwnership, BlobStore, CairnError, HashAlgorithm, NodeInfo, OwnershipStore, Result,
};
use serde::Serialize;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub oid: String,
    pub current: usize,
    pub target: usize,
    pub owners: Vec<String>,
}

/// Which peers accepted a replication instruction and which did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub instructed: Vec<String>,
    pub failed: Vec<String>,
}

/// Tracks blob owners and pushes blobs toward their replica target.
#[derive(Clone)]
pub struct ReplicationController {
    local: NodeInfo,
    ownership: OwnershipStore,
    blobs: BlobStore,
    registry: DynRegistry,
    dispatcher: TaskDispatcher,
    settings: SettingsHandle,
    index: DynMetadataIndex,
}

impl ReplicationController {
    pub fn new(
        local: NodeInfo,
        ownership: OwnershipStore,
        blobs: BlobStore,
        registry: DynRegistry,
        dispatcher: TaskDispatcher,
        settings: SettingsHandle,
        index: DynMetadataIndex,
    ) -> Self {
        Self {
            local,
            ownership,
            blobs,
            registry,
            dispatcher,
            settings,
            index,
        }
    }

    /// The node this controller acts for.
    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    /// Adds this node to the owners of `oid`. Unless the caller just wrote the
    /// blob itself (`is_local`), the file must already be on disk.
    pub async fn record_ownership(
        &self,
        oid: &str,
        length: u64,
        is_local: bool,
    ) -> Result<BlobOwnership> {
        if !is_local && !self.blobs.contains(oid) {
            return Err(CairnError::BlobNotFound(oid.to_string()));
        }

        let record = self
            .ownership
            .add_owner(oid, length, &self.local.node_id)
            .await?;
        tracing::debug!(
            "recorded ownership oid={} node={} replicas={}",
            oid,
            self.local.node_id,
            record.replica_count()
        );
        Ok(record)
    }

    /// Owners of `oid` against the configured target. Unknown blobs report zero owners.
    pub async fn replica_status(&self, oid: &str) -> Result<ReplicaStatus> {
        let target = self.settings.snapshot().min_replicas;
        let owners: Vec<String> = self
            .ownership
            .get(oid)
            .await?
            .map(|record| record.nodes.into_keys().collect())
            .unwrap_or_default();

        Ok(ReplicaStatus {
            oid: oid.to_string(),
            current: owners.len(),
            target,
            owners,
        })
    }

    /// Instructs up to `additional` peers that do not hold `oid` to pull it.
    /// Failures are logged and the next candidate is tried; nothing is
    /// returned as an error.
    pub async fn increase_replica_count(
        &self,
        oid: &str,
        length: u64,
        additional: usize,
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        if additional == 0 {
            return report;
        }

        let settings = self.settings.snapshot();
        let ownership = match self.ownership.get(oid).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!("replication of {} skipped, ownership lookup failed: {}", oid, error);
                return report;
            }
        };

        let remote = match list_remote_nodes(
            self.registry.as_ref(),
            &self.local.node_id,
            settings.node_stale_after(),
        )
        .await
        {
            Ok(nodes) => nodes,
            Err(error) => {
                tracing::warn!("replication of {} skipped, registry lookup failed: {}", oid, error);
                return report;
            }
        };

        let owned_by = |node: &NodeInfo| {
            ownership
                .as_ref()
                .is_some_and(|record| record.is_owned_by(&node.node_id))
        };

        let source = if owned_by(&self.local) || self.blobs.contains(oid) {
            self.local.clone()
        } else {
            match remote.iter().find(|node| owned_by(*node)) {
                Some(node) => node.clone(),
                None => {
                    tracing::warn!("replication of {} skipped, no live owner to copy from", oid);
                    return report;
                }
            }
        };

        let mut candidates: Vec<NodeInfo> =
            remote.into_iter().filter(|node| !owned_by(node)).collect();
        candidates.sort_by_cached_key(|node| rendezvous_score(oid, &node.node_id));

        for target in candidates {
            if report.instructed.len() >= additional {
                break;
            }

            let task = InternodeTask::RequestFetch {
                target: target.clone(),
                source: source.clone(),
                oid: oid.to_string(),
            };
            match self.dispatcher.submit_and_wait(task).await {
                Ok(()) => {
                    tracing::info!(
                        "asked {} to replicate {} ({} bytes) from {}",
                        target.node_id,
                        oid,
                        length,
                        source.node_id
                    );
                    report.instructed.push(target.node_id);
                }
                Err(error) => {
                    tracing::warn!(
                        "replication request for {} to {} failed: {}",
                        oid,
                        target.node_id,
                        error
                    );
                    report.failed.push(target.node_id);
                }
            }
        }

        if report.instructed.len() < additional {
            tracing::warn!(
                "blob {} wanted {} more replicas, {} peers accepted",
                oid,
                additional,
                report.instructed.len()
            );
        }
        report
    }

    /// `increase_replica_count` on a background task.
    pub fn spawn_increase_replica_count(
        &self,
        oid: String,
        length: u64,
        additional: usize,
    ) -> JoinHandle<ReplicationReport> {
        let controller = self.clone();
        tokio::spawn(async move {
            controller
                .increase_replica_count(&oid, length, additional)
                .await
        })
    }

    /// One pass over under-replicated blobs this node holds. Returns how many
    /// blobs were pushed.
    pub async fn reconcile_once(&self, limit: usize) -> Result<usize> {
        let target = self.settings.snapshot().min_replicas;
        let rows = self.index.under_replicated(target, limit).await?;

        let mut pushed = 0;
        for row in rows {
            if !self.blobs.contains(&row.oid) {
                continue;
            }
            let deficit = target.saturating_sub(row.replicas);
            let report = self
                .increase_replica_count(&row.oid, row.length, deficit)
                .await;
            if !report.instructed.is_empty() {
                pushed += 1;
            }
        }

        if pushed > 0 {
            tracing::info!("reconcile pushed {} under-replicated blobs", pushed);
        }
        Ok(pushed)
    }
}

fn rendezvous_score(oid: &str, node_id: &str) -> String {
    HashAlgorithm::Sha256.digest(format!("{}{}", oid, node_id).as_bytes())
}
