use crate::operations::backup::{BackupRecord, latest_backup_marker};
use crate::{BlobStore, CairnError, DocKind, MetadataStore, Result, normalize_path};
use flate2::read::GzDecoder;
use std::io::{BufRead, BufReader};
use tokio::sync::mpsc;

const RECORD_CHANNEL_SIZE: usize = 64;

/// Loads a backup blob back into the metadata store.
#[derive(Clone)]
pub struct RestoreBackupOperation {
    blobs: BlobStore,
    metadata: MetadataStore,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreBackupOperationRequest {
    /// Backup blob to read, the recorded marker when unset.
    pub oid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RestoreBackupOperationResult {
    pub oid: String,
    pub restored: u64,
    pub skipped: u64,
}

impl RestoreBackupOperation {
    pub fn new(blobs: BlobStore, metadata: MetadataStore) -> Self {
        Self { blobs, metadata }
    }

    pub async fn run(
        &self,
        request: RestoreBackupOperationRequest,
    ) -> Result<RestoreBackupOperationResult> {
        let oid = match request.oid {
            Some(oid) => oid,
            None => latest_backup_marker(self.blobs.root())
                .await?
                .ok_or_else(|| CairnError::NotFound("no backup has been recorded".to_string()))?,
        };

        let blob_path = self.blobs.blob_path(&oid)?;
        if !self.blobs.contains(&oid) {
            return Err(CairnError::BlobNotFound(oid));
        }

        let (record_tx, mut record_rx) = mpsc::channel::<Result<BackupRecord>>(RECORD_CHANNEL_SIZE);
        let reader = tokio::task::spawn_blocking(move || {
            let file = match std::fs::File::open(&blob_path) {
                Ok(file) => file,
                Err(error) => {
                    let _ = record_tx.blocking_send(Err(error.into()));
                    return;
                }
            };

            let lines = BufReader::new(GzDecoder::new(file)).lines();
            for (index, line) in lines.enumerate() {
                let item = match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => serde_json::from_str::<BackupRecord>(&line).map_err(|error| {
                        CairnError::Encode(format!("backup line {}: {}", index + 1, error))
                    }),
                    Err(error) => Err(CairnError::Encode(format!(
                        "backup line {}: {}",
                        index + 1,
                        error
                    ))),
                };
                let failed = item.is_err();
                if record_tx.blocking_send(item).is_err() || failed {
                    return;
                }
            }
        });

        let mut restored = 0u64;
        let mut skipped = 0u64;
        while let Some(item) = record_rx.recv().await {
            let record = item?;
            if record.meta.kind != DocKind::File {
                skipped += 1;
                continue;
            }

            let path = normalize_path(&record.path)?;
            if self.metadata.put_restored(&path, &record.meta).await? {
                restored += 1;
            } else {
                skipped += 1;
            }
        }

        reader
            .await
            .map_err(|error| CairnError::Internal(format!("backup reader panicked: {}", error)))?;

        tracing::info!(
            "restored backup {}: {} records applied, {} skipped",
            oid,
            restored,
            skipped
        );
        Ok(RestoreBackupOperationResult {
            oid,
            restored,
            skipped,
        })
    }
}
