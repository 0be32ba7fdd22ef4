use crate::operations::{InternalFetchOperation, InternalFetchOperationRequest};
use crate::registry::{DynRegistry, list_remote_nodes};
use crate::settings::SettingsHandle;
use crate::{
    BlobStore, CairnError, FileMeta, MetadataStore, OwnershipStore, Result, normalize_path,
};

#[derive(Clone)]
pub struct ReadFileOperation {
    blobs: BlobStore,
    metadata: MetadataStore,
    ownership: OwnershipStore,
    registry: DynRegistry,
    settings: SettingsHandle,
    fetch: InternalFetchOperation,
    local_node_id: String,
}

#[derive(Debug, Clone)]
pub struct ReadFileOperationRequest {
    pub path: String,
    /// Skip opening the blob, for HEAD-style lookups.
    pub include_body: bool,
}

#[derive(Debug)]
pub struct ReadFileOperationResult {
    pub meta: FileMeta,
    pub body: Option<tokio::fs::File>,
}

#[derive(Debug)]
pub enum ReadFileOperationOutcome {
    Found(ReadFileOperationResult),
    NotFound,
}

impl ReadFileOperation {
    pub fn new(
        blobs: BlobStore,
        metadata: MetadataStore,
        ownership: OwnershipStore,
        registry: DynRegistry,
        settings: SettingsHandle,
        fetch: InternalFetchOperation,
        local_node_id: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            ownership,
            registry,
            settings,
            fetch,
            local_node_id: local_node_id.into(),
        }
    }

    /// Looks up `request.path`; with a body, pulls the blob from an owner first
    /// if this node lacks it.
    pub async fn run(&self, request: ReadFileOperationRequest) -> Result<ReadFileOperationOutcome> {
        let path = normalize_path(&request.path)?;
        let Some(meta) = self.metadata.get(&path).await? else {
            return Ok(ReadFileOperationOutcome::NotFound);
        };

        if !request.include_body {
            return Ok(ReadFileOperationOutcome::Found(ReadFileOperationResult {
                meta,
                body: None,
            }));
        }

        if !self.blobs.contains(&meta.oid) {
            self.pull_from_owners(&meta.oid).await?;
        }

        let body = self.blobs.open(&meta.oid).await?;
        Ok(ReadFileOperationOutcome::Found(ReadFileOperationResult {
            meta,
            body: Some(body),
        }))
    }

    async fn pull_from_owners(&self, oid: &str) -> Result<()> {
        let Some(ownership) = self.ownership.get(oid).await? else {
            return Err(CairnError::BlobNotFound(oid.to_string()));
        };

        let peers = list_remote_nodes(
            self.registry.as_ref(),
            &self.local_node_id,
            self.settings.snapshot().node_stale_after(),
        )
        .await?;

        for peer in peers.into_iter().filter(|peer| ownership.is_owned_by(&peer.node_id)) {
            let request = InternalFetchOperationRequest {
                oid: oid.to_string(),
                source: peer.clone(),
            };
            match self.fetch.run(request).await {
                Ok(result) => {
                    tracing::info!(
                        "pulled {} ({} bytes) from {} to serve a read",
                        oid,
                        result.length,
                        peer.node_id
                    );
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!("failed to pull {} from {}: {}", oid, peer.node_id, error);
                }
            }
        }

        Err(CairnError::BlobNotFound(oid.to_string()))
    }
}
