use crate::index::{DynMetadataIndex, LocalIndex};
use crate::operations::{
    BackupOperation, InternalFetchOperation, ListFilesOperation, PutFileOperation,
    ReadFileOperation, RestoreBackupOperation,
};
use crate::registry::DynRegistry;
use crate::settings::{ClusterSettings, SettingsHandle, SettingsStore};
use crate::storage::{KvNamespaces, MetadataBackend};
use crate::tasks::{DispatcherConfig, InternodeExecutor, TaskDispatcher};
use crate::{
    BlobStore, CairnError, ClusterClient, MetadataStore, NodeInfo, OwnershipStore,
    ReplicationController, Result,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: String,
    /// `host:port` other nodes use to reach this one.
    pub address: String,
    pub root: PathBuf,
    pub metadata_backend: MetadataBackend,
    /// Defaults to `<root>/cairn.db`.
    pub metadata_path: Option<PathBuf>,
    pub workers: usize,
    pub queue_per_worker: usize,
}

/// Everything a running node needs, wired together once at startup.
#[derive(Clone)]
pub struct NodeServices {
    pub local: NodeInfo,
    pub blobs: BlobStore,
    pub metadata: MetadataStore,
    pub ownership: OwnershipStore,
    pub settings: SettingsHandle,
    pub settings_store: SettingsStore,
    pub registry: DynRegistry,
    pub index: DynMetadataIndex,
    pub dispatcher: TaskDispatcher,
    pub replication: ReplicationController,
    pub put_file: PutFileOperation,
    pub read_file: ReadFileOperation,
    pub list_files: ListFilesOperation,
    pub internal_fetch: InternalFetchOperation,
    pub backup: BackupOperation,
    pub restore: RestoreBackupOperation,
}

impl NodeServices {
    pub async fn open(
        options: NodeOptions,
        initial_settings: ClusterSettings,
        registry: DynRegistry,
    ) -> Result<Self> {
        let metadata_path = options
            .metadata_path
            .clone()
            .unwrap_or_else(|| options.root.join("cairn.db"));
        let namespaces = KvNamespaces::open(options.metadata_backend, &metadata_path)?;
        Self::with_namespaces(options, namespaces, initial_settings, registry).await
    }

    /// Builds a node on top of already opened namespaces. Nodes handed the
    /// same namespaces see one shared metadata store.
    pub async fn with_namespaces(
        options: NodeOptions,
        namespaces: KvNamespaces,
        initial_settings: ClusterSettings,
        registry: DynRegistry,
    ) -> Result<Self> {
        if options.node_id.trim().is_empty() {
            return Err(CairnError::Config("node_id cannot be empty".to_string()));
        }

        let settings_store = SettingsStore::new(namespaces.settings.clone());
        let settings = settings_store.load_or_init(&initial_settings).await?;
        if settings.hash != initial_settings.hash {
            tracing::warn!(
                "configured hash {:?} differs from the cluster's {:?}, using the cluster's",
                initial_settings.hash,
                settings.hash
            );
        }

        let blobs = BlobStore::new(options.root.clone(), settings.hash)?;
        let metadata = MetadataStore::new(namespaces.files.clone());
        let ownership = OwnershipStore::new(namespaces.blobs.clone());
        let client = ClusterClient::new(settings.internode_timeout())?;
        let local = NodeInfo::new(options.node_id.clone(), options.address.clone());

        let internal_fetch = InternalFetchOperation::new(
            blobs.clone(),
            ownership.clone(),
            client.clone(),
            local.node_id.clone(),
        );
        let dispatcher = TaskDispatcher::start(
            DispatcherConfig {
                workers: options.workers,
                queue_per_worker: options.queue_per_worker,
                ..DispatcherConfig::default()
            },
            Arc::new(InternodeExecutor::new(client, internal_fetch.clone())),
        );

        let index: DynMetadataIndex = Arc::new(LocalIndex::new(
            namespaces.files.clone(),
            namespaces.blobs.clone(),
        ));
        let settings = SettingsHandle::new(settings);

        let replication = ReplicationController::new(
            local.clone(),
            ownership.clone(),
            blobs.clone(),
            registry.clone(),
            dispatcher.clone(),
            settings.clone(),
            index.clone(),
        );

        let put_file = PutFileOperation::new(
            blobs.clone(),
            metadata.clone(),
            replication.clone(),
            settings.clone(),
        );
        let read_file = ReadFileOperation::new(
            blobs.clone(),
            metadata.clone(),
            ownership.clone(),
            registry.clone(),
            settings.clone(),
            internal_fetch.clone(),
            local.node_id.clone(),
        );
        let list_files = ListFilesOperation::new(metadata.clone(), index.clone());
        let backup = BackupOperation::new(
            blobs.clone(),
            metadata.clone(),
            replication.clone(),
            registry.clone(),
            dispatcher.clone(),
            settings.clone(),
        );
        let restore = RestoreBackupOperation::new(blobs.clone(), metadata.clone());

        let services = Self {
            local,
            blobs,
            metadata,
            ownership,
            settings,
            settings_store,
            registry,
            index,
            dispatcher,
            replication,
            put_file,
            read_file,
            list_files,
            internal_fetch,
            backup,
            restore,
        };
        services.heartbeat().await?;

        tracing::info!(
            "node {} ready at {} (root={:?}, hash={:?})",
            services.local.node_id,
            services.local.address,
            services.blobs.root(),
            services.blobs.algorithm()
        );
        Ok(services)
    }

    /// Re-registers this node with a fresh heartbeat.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut info = self.local.clone();
        info.touch();
        self.registry.register_node(&info).await
    }

    pub async fn reload_settings(&self) -> Result<bool> {
        self.settings_store.reload_into(&self.settings).await
    }

    /// Persists new cluster settings and swaps them in. The hash algorithm of a
    /// running cluster cannot change.
    pub async fn update_settings(&self, next: ClusterSettings) -> Result<ClusterSettings> {
        next.validate()
            .map_err(|error| CairnError::InvalidRequest(error.to_string()))?;
        let current = self.settings.snapshot();
        if next.hash != current.hash {
            return Err(CairnError::InvalidRequest(format!(
                "hash algorithm is fixed at {:?}",
                current.hash
            )));
        }

        self.settings_store.save(&next).await?;
        self.settings.replace(next.clone());
        Ok(next)
    }
}
