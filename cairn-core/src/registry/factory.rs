use super::{DynRegistry, etcd::EtcdRegistry, fixed::StaticRegistry, redis::RedisRegistry};
use crate::{CairnError, NodeInfo, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where node membership is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// A fixed peer list from configuration, plus whatever registers in-process.
    Static,
    Etcd,
    Redis,
}

impl RegistryKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "etcd" => Ok(Self::Etcd),
            "redis" => Ok(Self::Redis),
            "" => Err(CairnError::Config("no registry backend configured".to_string())),
            other => Err(CairnError::Config(format!(
                "unknown registry backend '{}' (expected static, etcd or redis)",
                other
            ))),
        }
    }
}

/// Collects registry settings from configuration and connects the chosen
/// backend. Only the settings of that backend are checked.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    backend: String,
    namespace: String,
    peers: Vec<NodeInfo>,
    etcd_endpoints: Vec<String>,
    redis_url: String,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn peers(mut self, peers: Vec<NodeInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = endpoints;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub async fn build(&self) -> Result<DynRegistry> {
        match RegistryKind::from_name(&self.backend)? {
            RegistryKind::Static => self.static_peers(),
            RegistryKind::Etcd => self.connect_etcd().await,
            RegistryKind::Redis => self.connect_redis().await,
        }
    }

    fn static_peers(&self) -> Result<DynRegistry> {
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.node_id.trim().is_empty() || peer.address.trim().is_empty() {
                return Err(CairnError::Config(
                    "static peers need both a node_id and an address".to_string(),
                ));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(CairnError::Config(format!(
                    "static peer '{}' is listed twice",
                    peer.node_id
                )));
            }
        }
        tracing::info!("using static registry with {} peers", self.peers.len());
        Ok(Arc::new(StaticRegistry::new(self.peers.clone())))
    }

    async fn connect_etcd(&self) -> Result<DynRegistry> {
        let namespace = self.key_prefix("etcd")?;
        let endpoints: Vec<String> = self
            .etcd_endpoints
            .iter()
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(CairnError::Config(
                "etcd registry needs at least one endpoint".to_string(),
            ));
        }

        Ok(Arc::new(EtcdRegistry::new(&endpoints, namespace).await?))
    }

    async fn connect_redis(&self) -> Result<DynRegistry> {
        let namespace = self.key_prefix("redis")?;
        let url = self.redis_url.trim();
        if url.is_empty() {
            return Err(CairnError::Config("redis registry needs a url".to_string()));
        }

        Ok(Arc::new(RedisRegistry::new(url, namespace).await?))
    }

    /// Shared backends keep every cluster under its own key prefix.
    fn key_prefix(&self, backend: &str) -> Result<&str> {
        let namespace = self.namespace.trim();
        if namespace.is_empty() {
            return Err(CairnError::Config(format!(
                "{} registry needs a namespace",
                backend
            )));
        }
        Ok(namespace)
    }
}
