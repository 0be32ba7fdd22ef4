use cairn_core::{
    CairnError, ClusterSettings, MetadataBackend, NodeInfo, NodeOptions, RegistryBuilder, Result,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    pub registry: RegistryConfig,
    /// Seeds the cluster settings the first time the metadata store is used.
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub root: PathBuf,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub backend: MetadataBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Registry backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    pub etcd: Option<EtcdConfig>,
    pub redis: Option<RedisConfig>,
}

impl RegistryConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("cairn")
    }

    pub fn builder(&self) -> RegistryBuilder {
        let mut builder = RegistryBuilder::new()
            .backend(self.backend.as_str())
            .namespace(self.namespace_or_default())
            .peers(
                self.peers
                    .iter()
                    .map(|peer| NodeInfo::new(peer.node_id.clone(), peer.address.clone()))
                    .collect(),
            );
        if let Some(etcd) = &self.etcd {
            builder = builder.etcd_endpoints(etcd.endpoints.clone());
        }
        if let Some(redis) = &self.redis {
            builder = builder.redis_url(redis.url.clone());
        }
        builder
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Static,
    Etcd,
    Redis,
}

impl RegistryBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Etcd => "etcd",
            Self::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_per_worker")]
    pub queue_per_worker: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_per_worker: default_queue_per_worker(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_per_worker() -> usize {
    1024
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("CAIRN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CairnError::Config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(CairnError::Config("node.node_id cannot be empty".to_string()));
        }
        if self.tasks.workers == 0 || self.tasks.queue_per_worker == 0 {
            return Err(CairnError::Config(
                "tasks.workers and tasks.queue_per_worker must be positive".to_string(),
            ));
        }
        self.cluster.validate()
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            node_id: self.node.node_id.clone(),
            address: self.node.effective_address(),
            root: self.node.root.clone(),
            metadata_backend: self.metadata.backend,
            metadata_path: self.metadata.path.clone(),
            workers: self.tasks.workers,
            queue_per_worker: self.tasks.queue_per_worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{HashAlgorithm, RevisionRetention};

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        let path = path.to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let (_dir, path) = write_config(
            r#"
node:
  node_id: node-a
  bind_addr: 0.0.0.0:8484
  advertise_addr: 10.0.0.1:8484
  root: /var/lib/cairn
registry:
  backend: static
  peers:
    - node_id: node-b
      address: 10.0.0.2:8484
cluster:
  min_replicas: 2
  revision_retention: -1
  hash: sha512
"#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.effective_address(), "10.0.0.1:8484");
        assert_eq!(config.metadata.backend, MetadataBackend::Sqlite);
        assert_eq!(config.cluster.min_replicas, 2);
        assert_eq!(config.cluster.revision_retention, RevisionRetention::Unlimited);
        assert_eq!(config.cluster.hash, HashAlgorithm::Sha512);
        assert_eq!(config.tasks.workers, 4);
        assert_eq!(config.tasks.queue_per_worker, 1024);
        assert_eq!(config.registry.namespace_or_default(), "cairn");

        let options = config.node_options();
        assert_eq!(options.address, "10.0.0.1:8484");
    }

    #[test]
    fn test_unsupported_hash_is_rejected() {
        let (_dir, path) = write_config(
            r#"
node:
  node_id: node-a
  bind_addr: 0.0.0.0:8484
  root: /tmp/cairn
registry:
  backend: static
cluster:
  hash: md5
"#,
        );

        let error = Config::from_file(&path).unwrap_err().to_string();
        assert!(error.contains("sha256"), "{}", error);
    }

    #[test]
    fn test_bad_retention_is_rejected() {
        let (_dir, path) = write_config(
            r#"
node:
  node_id: node-a
  bind_addr: 0.0.0.0:8484
  root: /tmp/cairn
registry:
  backend: static
cluster:
  revision_retention: -4
"#,
        );

        assert!(Config::from_file(&path).is_err());
    }
}
