//! Cairn Core - replicated content-addressable file storage
//!
//! A node keeps:
//! - blobs named by the hash of their content
//! - versioned file metadata with bounded revision history (per-key CAS)
//! - blob ownership records used to drive replication toward a target count
//! - gzip JSON-lines backups of the whole metadata namespace

pub mod cluster;
pub mod error;
pub mod index;
pub mod node;
pub mod operations;
pub mod registry;
pub mod replication;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod tasks;

pub use cluster::ClusterClient;
pub use error::{CairnError, Result};
pub use index::{BrowseRow, DynMetadataIndex, LengthStats, LocalIndex, MetadataIndex, ReplicaCountRow};
pub use node::NodeInfo;
pub use operations::*;
pub use registry::etcd::EtcdRegistry;
pub use registry::fixed::StaticRegistry;
pub use registry::redis::RedisRegistry;
pub use registry::{DynRegistry, Registry, RegistryBuilder, list_remote_nodes};
pub use replication::{ReplicaStatus, ReplicationController, ReplicationReport};
pub use runtime::{NodeOptions, NodeServices};
pub use settings::{ClusterSettings, SettingsHandle, SettingsStore};
pub use storage::{
    BlobOwnership, BlobStore, DocKind, FileMeta, HashAlgorithm, HashRecorder, Headers,
    KvNamespaces, MetadataBackend, MetadataStore, OwnershipStore, PrevMeta, RevisionRetention,
    StagedBlob, normalize_path, validate_oid,
};
pub use tasks::{DispatcherConfig, InternodeTask, TaskDispatcher, TaskExecutor};
