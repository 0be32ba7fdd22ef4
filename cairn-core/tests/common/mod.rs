#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use async_trait::async_trait;
use cairn_core::storage::{CasOutcome, KvStore, MemoryKv, Versioned};
use cairn_core::{
    CairnError, ClusterSettings, InternalFetchOperationRequest, KvNamespaces, MetadataBackend,
    NodeInfo, NodeOptions, NodeServices, Registry, StaticRegistry,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use std::sync::Arc;

/// A node serving the peer-facing endpoints on an ephemeral port.
pub struct TestNode {
    pub services: NodeServices,
    pub dir: tempfile::TempDir,
}

pub fn node_options(node_id: &str, address: &str, root: &std::path::Path) -> NodeOptions {
    NodeOptions {
        node_id: node_id.to_string(),
        address: address.to_string(),
        root: root.to_path_buf(),
        metadata_backend: MetadataBackend::Memory,
        metadata_path: None,
        workers: 2,
        queue_per_worker: 16,
    }
}

/// Starts `ids.len()` nodes that share one metadata store and one registry.
pub async fn start_cluster(
    ids: &[&str],
    settings: ClusterSettings,
) -> (Vec<TestNode>, Arc<StaticRegistry>) {
    let namespaces = KvNamespaces::in_memory();
    let registry = Arc::new(StaticRegistry::new(Vec::new()));

    let mut nodes = Vec::new();
    for id in ids {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let dir = tempfile::tempdir().unwrap();

        let services = NodeServices::with_namespaces(
            node_options(id, &address, dir.path()),
            namespaces.clone(),
            settings.clone(),
            registry.clone(),
        )
        .await
        .unwrap();

        let app = peer_router(services.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        nodes.push(TestNode { services, dir });
    }

    (nodes, registry)
}

/// Registers a node nobody listens for.
pub async fn register_unreachable(registry: &StaticRegistry, node_id: &str) {
    registry
        .register_node(&NodeInfo::new(node_id, "127.0.0.1:1"))
        .await
        .unwrap();
}

/// Registers a node that answers blob downloads with a few bytes and then
/// goes silent while keeping the connection open.
pub async fn start_stalled_peer(registry: &StaticRegistry, node_id: &str) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let app = Router::new().route(
        "/.cairn/blob/:oid",
        get(|| async {
            let head = stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"par")) });
            Body::from_stream(head.chain(stream::pending()))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    registry
        .register_node(&NodeInfo::new(node_id, address))
        .await
        .unwrap();
}

#[derive(Deserialize)]
struct FetchQuery {
    from: String,
    addr: String,
}

fn peer_router(services: NodeServices) -> Router {
    Router::new()
        .route("/.cairn/blob/:oid", get(get_blob))
        .route("/.cairn/fetch/:oid", post(fetch))
        .route("/.cairn/backup/mark/:oid", post(mark_backup))
        .with_state(services)
}

async fn get_blob(State(services): State<NodeServices>, Path(oid): Path<String>) -> Response {
    let path = match services.blobs.blob_path(&oid) {
        Ok(path) => path,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Pulls inline so a 202 means the blob has landed.
async fn fetch(
    State(services): State<NodeServices>,
    Path(oid): Path<String>,
    Query(query): Query<FetchQuery>,
) -> Response {
    let request = InternalFetchOperationRequest {
        oid,
        source: NodeInfo::new(query.from, query.addr),
    };
    match services.internal_fetch.run(request).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn mark_backup(State(services): State<NodeServices>, Path(oid): Path<String>) -> StatusCode {
    match cairn_core::record_backup_marker(services.blobs.root(), &oid).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn hex_files(root: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.chars().all(|c| c.is_ascii_hexdigit()))
        .collect();
    names.sort();
    names
}

pub fn tmp_files(root: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(root.join("tmp"))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// In-memory namespace whose scans can be made to fail partway through a walk.
pub struct FailingScanKv {
    inner: MemoryKv,
    scans_left: AtomicI64,
}

impl FailingScanKv {
    pub fn new() -> Self {
        Self {
            inner: MemoryKv::new(),
            scans_left: AtomicI64::new(-1),
        }
    }

    /// Lets `scans` more scans through, then fails every one after them.
    pub fn fail_after(&self, scans: i64) {
        self.scans_left.store(scans, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for FailingScanKv {
    async fn get(&self, key: &str) -> cairn_core::Result<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> cairn_core::Result<BTreeMap<String, Versioned>> {
        self.inner.get_many(keys).await
    }

    async fn put_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> cairn_core::Result<CasOutcome> {
        self.inner.put_if(key, expected, value).await
    }

    async fn scan(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> cairn_core::Result<Vec<(String, Versioned)>> {
        match self.scans_left.load(Ordering::SeqCst) {
            0 => return Err(CairnError::Internal("scan failed".to_string())),
            left if left > 0 => {
                self.scans_left.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.inner.scan(after, limit).await
    }
}
