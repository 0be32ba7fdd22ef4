use crate::{BlobStore, ClusterClient, NodeInfo, OwnershipStore, Result, validate_oid};

/// Receiving side of a replication instruction: copy one blob from a peer.
#[derive(Clone)]
pub struct InternalFetchOperation {
    blobs: BlobStore,
    ownership: OwnershipStore,
    client: ClusterClient,
    local_node_id: String,
}

#[derive(Debug, Clone)]
pub struct InternalFetchOperationRequest {
    pub oid: String,
    pub source: NodeInfo,
}

#[derive(Debug, Clone)]
pub struct InternalFetchOperationResult {
    pub oid: String,
    pub length: u64,
    pub reused: bool,
}

impl InternalFetchOperation {
    pub fn new(
        blobs: BlobStore,
        ownership: OwnershipStore,
        client: ClusterClient,
        local_node_id: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            ownership,
            client,
            local_node_id: local_node_id.into(),
        }
    }

    pub async fn run(
        &self,
        request: InternalFetchOperationRequest,
    ) -> Result<InternalFetchOperationResult> {
        let InternalFetchOperationRequest { oid, source } = request;
        validate_oid(&oid)?;

        if self.blobs.contains(&oid) {
            let length = self.blobs.blob_len(&oid).await?;
            self.ownership
                .add_owner(&oid, length, &self.local_node_id)
                .await?;
            return Ok(InternalFetchOperationResult {
                oid,
                length,
                reused: true,
            });
        }

        let body = self.client.fetch_blob(&source, &oid).await?;
        let (stored, length) = self
            .blobs
            .verifying_recorder(&oid)?
            .process_stream(body)
            .await?;

        self.ownership
            .add_owner(&stored, length, &self.local_node_id)
            .await?;
        tracing::debug!(
            "fetched blob {} ({} bytes) from {}",
            stored,
            length,
            source.node_id
        );

        Ok(InternalFetchOperationResult {
            oid: stored,
            length,
            reused: false,
        })
    }
}
