//! Storage modules for Cairn
//!
//! Content-addressed blob files plus the CAS key/value namespaces that hold
//! file metadata, blob ownership and cluster settings.

pub mod blob_store;
pub mod kv;
pub mod metadata_store;
pub mod ownership_store;
pub mod sqlite_kv;

pub use blob_store::{BlobStore, HashAlgorithm, HashRecorder, StagedBlob, validate_oid};
pub use kv::{CasOutcome, DynKvStore, KvStore, MemoryKv, Versioned, update_with_retry};
pub use metadata_store::{
    DocKind, FileMeta, Headers, MetadataStore, PrevMeta, RevisionRetention, next_revision,
    normalize_path,
};
pub use ownership_store::{BlobOwnership, OwnershipStore};
pub use sqlite_kv::SqliteKv;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const FILES_NAMESPACE: &str = "files";
const BLOBS_NAMESPACE: &str = "blobs";
const SETTINGS_NAMESPACE: &str = "settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    #[default]
    Sqlite,
    Memory,
}

/// The three key spaces a node keeps.
#[derive(Clone)]
pub struct KvNamespaces {
    pub files: DynKvStore,
    pub blobs: DynKvStore,
    pub settings: DynKvStore,
}

impl KvNamespaces {
    pub fn open(backend: MetadataBackend, db_path: &Path) -> Result<Self> {
        match backend {
            MetadataBackend::Sqlite => Ok(Self {
                files: Arc::new(SqliteKv::open(db_path, FILES_NAMESPACE)?),
                blobs: Arc::new(SqliteKv::open(db_path, BLOBS_NAMESPACE)?),
                settings: Arc::new(SqliteKv::open(db_path, SETTINGS_NAMESPACE)?),
            }),
            MetadataBackend::Memory => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            files: Arc::new(MemoryKv::new()),
            blobs: Arc::new(MemoryKv::new()),
            settings: Arc::new(MemoryKv::new()),
        }
    }
}
