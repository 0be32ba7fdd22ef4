use crate::settings::SettingsHandle;
use crate::{
    BlobStore, FileMeta, Headers, MetadataStore, ReplicationController, Result, RevisionRetention,
    normalize_path,
};
use bytes::Bytes;
use futures_util::Stream;
use std::fmt::Display;

#[derive(Clone)]
pub struct PutFileOperation {
    blobs: BlobStore,
    metadata: MetadataStore,
    replication: ReplicationController,
    settings: SettingsHandle,
}

#[derive(Debug, Clone)]
pub struct PutFileOperationRequest {
    pub path: String,
    pub headers: Headers,
    pub userdata: Option<serde_json::Value>,
    /// Falls back to the cluster default when unset.
    pub retention: Option<RevisionRetention>,
}

#[derive(Debug, Clone)]
pub struct PutFileOperationResult {
    pub path: String,
    pub meta: FileMeta,
}

impl PutFileOperation {
    pub fn new(
        blobs: BlobStore,
        metadata: MetadataStore,
        replication: ReplicationController,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            blobs,
            metadata,
            replication,
            settings,
        }
    }

    pub async fn run<S, E>(
        &self,
        request: PutFileOperationRequest,
        body: S,
    ) -> Result<PutFileOperationResult>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let PutFileOperationRequest {
            path,
            headers,
            userdata,
            retention,
        } = request;
        let path = normalize_path(&path)?;
        let settings = self.settings.snapshot();

        let (oid, length) = self.blobs.recorder().process_stream(body).await?;
        let ownership = self.replication.record_ownership(&oid, length, true).await?;

        let mut proposed = FileMeta::new(oid.clone(), length, headers);
        proposed.userdata = userdata;
        let meta = self
            .metadata
            .update(
                &path,
                proposed,
                retention.unwrap_or(settings.revision_retention),
            )
            .await?;

        let deficit = settings
            .min_replicas
            .saturating_sub(ownership.replica_count());
        if deficit > 0 {
            self.replication
                .spawn_increase_replica_count(oid, length, deficit);
        }

        tracing::info!(
            "stored {} oid={} length={} revno={}",
            path,
            meta.oid,
            meta.length,
            meta.revno
        );
        Ok(PutFileOperationResult { path, meta })
    }
}
