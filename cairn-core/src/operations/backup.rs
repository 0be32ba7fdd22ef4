//! Metadata export: every file record as gzip-compressed JSON lines, stored
//! as a blob in the cluster itself.

use crate::registry::{DynRegistry, list_remote_nodes};
use crate::settings::SettingsHandle;
use crate::tasks::{InternodeTask, TaskDispatcher};
use crate::{
    BlobStore, CairnError, FileMeta, Headers, MetadataStore, ReplicationController, Result,
    RevisionRetention, normalize_path, validate_oid,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

pub const BACKUP_MARKER_FILE: &str = ".backup";

const SCAN_PAGE: usize = 256;
const RECORD_CHANNEL_SIZE: usize = 64;
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One line of a backup stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub path: String,
    pub meta: FileMeta,
}

/// Writes every file record to `sink` as gzip JSON lines, in path order.
/// Returns the number of records written. The gzip trailer is written even
/// when the walk fails.
pub async fn backup_to<W>(metadata: &MetadataStore, sink: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (record_tx, mut record_rx) = mpsc::channel::<BackupRecord>(RECORD_CHANNEL_SIZE);
    let (done_tx, mut done_rx) = oneshot::channel::<Result<u64>>();

    tokio::spawn(enumerate_files(metadata.clone(), record_tx, done_tx));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let streamed = stream_records(&mut record_rx, &mut done_rx, &mut encoder, sink).await;
    drop(record_rx);
    let finished = finish_gzip(encoder, sink).await;

    let count = match (streamed, finished) {
        (Err(error), _) | (Ok(_), Err(error)) => {
            tracing::error!("backup failed after {:?}: {}", started.elapsed(), error);
            return Err(error);
        }
        (Ok(count), Ok(())) => count,
    };

    tracing::info!(
        "completed backup of {} files in {:?}",
        count,
        started.elapsed()
    );
    Ok(count)
}

async fn enumerate_files(
    metadata: MetadataStore,
    record_tx: mpsc::Sender<BackupRecord>,
    done_tx: oneshot::Sender<Result<u64>>,
) {
    let mut after: Option<String> = None;
    let mut sent = 0u64;

    let result = loop {
        let page = match metadata.scan_page(after.as_deref(), SCAN_PAGE).await {
            Ok(page) => page,
            Err(error) => break Err(error),
        };
        let Some((last_key, _)) = page.last() else {
            break Ok(sent);
        };
        after = Some(last_key.clone());

        let mut receiver_gone = false;
        for (path, raw) in page {
            let Some(meta) = FileMeta::decode(&raw) else {
                tracing::debug!("backup skipping non-file record {}", path);
                continue;
            };
            if record_tx.send(BackupRecord { path, meta }).await.is_err() {
                receiver_gone = true;
                break;
            }
            sent += 1;
        }
        if receiver_gone {
            break Err(CairnError::Internal(
                "backup consumer stopped reading".to_string(),
            ));
        }
    };

    let _ = done_tx.send(result);
}

async fn stream_records<W>(
    record_rx: &mut mpsc::Receiver<BackupRecord>,
    done_rx: &mut oneshot::Receiver<Result<u64>>,
    encoder: &mut GzEncoder<Vec<u8>>,
    sink: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    let mut producer_done = false;

    loop {
        tokio::select! {
            record = record_rx.recv() => {
                let Some(record) = record else {
                    if !producer_done {
                        check_signal(done_rx.await)?;
                    }
                    return Ok(written);
                };
                tracing::debug!("backing up {}", record.path);
                encode_record(encoder, &record)?;
                drain(encoder, sink).await?;
                written += 1;
            }
            signal = &mut *done_rx, if !producer_done => {
                producer_done = true;
                check_signal(signal)?;
            }
        }
    }
}

fn check_signal(signal: std::result::Result<Result<u64>, oneshot::error::RecvError>) -> Result<()> {
    match signal {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(CairnError::Internal(
            "backup enumeration ended without a result".to_string(),
        )),
    }
}

fn encode_record(encoder: &mut GzEncoder<Vec<u8>>, record: &BackupRecord) -> Result<()> {
    serde_json::to_writer(&mut *encoder, record)
        .map_err(|error| CairnError::Encode(error.to_string()))?;
    encoder
        .write_all(b"\n")
        .map_err(|error| CairnError::Encode(error.to_string()))
}

async fn drain<W>(encoder: &mut GzEncoder<Vec<u8>>, sink: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buffered = encoder.get_mut();
    if !buffered.is_empty() {
        sink.write_all(buffered.as_slice()).await?;
        buffered.clear();
    }
    Ok(())
}

async fn finish_gzip<W>(encoder: GzEncoder<Vec<u8>>, sink: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let tail = encoder
        .finish()
        .map_err(|error| CairnError::Encode(error.to_string()))?;
    sink.write_all(&tail).await?;
    sink.flush().await?;
    Ok(())
}

/// Overwrites the marker naming the latest backup blob.
pub async fn record_backup_marker(root: &Path, oid: &str) -> Result<()> {
    validate_oid(oid)?;
    tokio::fs::write(root.join(BACKUP_MARKER_FILE), format!("{}\n", oid)).await?;
    Ok(())
}

/// Oid named by the local marker, or `None` if no backup was ever recorded here.
pub async fn latest_backup_marker(root: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(root.join(BACKUP_MARKER_FILE)).await {
        Ok(contents) => {
            let oid = contents.trim();
            if oid.is_empty() {
                Ok(None)
            } else {
                Ok(Some(oid.to_string()))
            }
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

#[derive(Clone)]
pub struct BackupOperation {
    blobs: BlobStore,
    metadata: MetadataStore,
    replication: ReplicationController,
    registry: DynRegistry,
    dispatcher: TaskDispatcher,
    settings: SettingsHandle,
}

#[derive(Debug, Clone)]
pub struct BackupOperationRequest {
    /// Path the backup is stored under.
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOperationResult {
    pub path: String,
    pub oid: String,
    pub length: u64,
    pub files: u64,
}

impl BackupOperation {
    pub fn new(
        blobs: BlobStore,
        metadata: MetadataStore,
        replication: ReplicationController,
        registry: DynRegistry,
        dispatcher: TaskDispatcher,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            blobs,
            metadata,
            replication,
            registry,
            dispatcher,
            settings,
        }
    }

    /// Exports all file metadata into a new blob stored at `request.name`,
    /// then marks it locally and on live peers. Nothing is kept if the export fails.
    pub async fn run(&self, request: BackupOperationRequest) -> Result<BackupOperationResult> {
        let path = normalize_path(&request.name)?;

        let (reader, mut writer) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let metadata = self.metadata.clone();
        let producer = tokio::spawn(async move {
            let result = backup_to(&metadata, &mut writer).await;
            let _ = writer.shutdown().await;
            result
        });

        let staged = self.blobs.recorder().stage(reader).await;
        let produced = producer
            .await
            .map_err(|error| CairnError::Internal(format!("backup producer panicked: {}", error)))?;

        let staged = staged?;
        let files = produced?;
        let (oid, length) = staged.commit().await?;

        self.replication.record_ownership(&oid, length, true).await?;

        let mut headers = Headers::new();
        headers.insert(
            "Content-Type".to_string(),
            vec!["application/gzip".to_string()],
        );
        self.metadata
            .update(
                &path,
                FileMeta::new(oid.clone(), length, headers),
                RevisionRetention::Limited(1),
            )
            .await?;

        if let Err(error) = record_backup_marker(self.blobs.root(), &oid).await {
            tracing::warn!("failed to record backup marker {}: {}", oid, error);
        }

        self.broadcast_marker(oid.clone());

        let settings = self.settings.snapshot();
        tracing::info!("replicating backup {}", oid);
        self.replication.spawn_increase_replica_count(
            oid.clone(),
            length,
            settings.min_replicas.saturating_sub(1),
        );

        Ok(BackupOperationResult {
            path,
            oid,
            length,
            files,
        })
    }

    fn broadcast_marker(&self, oid: String) {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let local_node_id = self.replication.local_node().node_id.clone();
        let stale_after = self.settings.snapshot().node_stale_after();

        tokio::spawn(async move {
            let peers =
                match list_remote_nodes(registry.as_ref(), &local_node_id, stale_after).await {
                    Ok(peers) => peers,
                    Err(error) => {
                        tracing::warn!("cannot list peers to mark backup {}: {}", oid, error);
                        return;
                    }
                };

            for target in peers {
                let task = InternodeTask::MarkBackup {
                    target,
                    oid: oid.clone(),
                };
                if let Err(error) = dispatcher.submit(task).await {
                    tracing::warn!("failed to queue backup marker for {}: {}", oid, error);
                    return;
                }
            }
        });
    }
}
