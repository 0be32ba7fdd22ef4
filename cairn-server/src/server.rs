use crate::config::Config;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cairn_core::cluster::INTERNAL_PREFIX;
use cairn_core::{
    BackupOperationRequest, CairnError, ClusterSettings, Headers, InternodeTask,
    ListFilesOperationRequest, NodeInfo, NodeOptions, NodeServices, PutFileOperationRequest,
    ReadFileOperationOutcome, ReadFileOperationRequest, RestoreBackupOperationRequest, Result,
    RevisionRetention, latest_backup_marker, record_backup_marker, validate_oid,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

const USERDATA_HEADER: &str = "x-cairn-userdata";
const SETTINGS_RELOAD_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILE_BATCH: usize = 256;

pub struct ServerState {
    pub services: NodeServices,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn respond(status: StatusCode, data: T) -> Response {
        let resp = ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        };
        (status, Json(resp)).into_response()
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(resp)).into_response()
}

fn error_status(error: &CairnError) -> StatusCode {
    match error {
        CairnError::InvalidRequest(_) | CairnError::HashMismatch { .. } => {
            StatusCode::BAD_REQUEST
        }
        CairnError::NotFound(_) | CairnError::BlobNotFound(_) => StatusCode::NOT_FOUND,
        CairnError::CasConflict(_) => StatusCode::CONFLICT,
        CairnError::PeerStatus { .. } | CairnError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: CairnError) -> Response {
    error_response(error_status(&error), error.to_string())
}

/// Accepts the same spellings as Go's `strconv.ParseBool`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn flag(value: Option<&str>) -> bool {
    value.and_then(parse_bool).unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(default)]
    revs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_depth")]
    depth: usize,
    #[serde(default, rename = "includeMeta")]
    include_meta: Option<String>,
}

fn default_depth() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupQuery {
    #[serde(default, rename = "fn")]
    name: Option<String>,
    #[serde(default)]
    bg: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    node_id: String,
    address: String,
    min_replicas: usize,
    queue_capacity: usize,
}

#[derive(Debug, Serialize)]
struct BackupMarkerResponse {
    oid: String,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(&internal("/nodes"), get(list_nodes))
        .route(&internal("/config"), get(get_config).put(put_config))
        .route(&internal("/meta/*path"), get(get_meta))
        .route(&internal("/list"), get(list_root))
        .route(&internal("/list/*path"), get(list_path))
        .route(&internal("/blob/:oid"), get(get_blob))
        .route(&internal("/fetch/:oid"), post(fetch_blob))
        .route(&internal("/replicas/:oid"), get(replica_status))
        .route(&internal("/backup"), post(backup))
        .route(&internal("/backup/mark/:oid"), post(mark_backup))
        .route(&internal("/backup/latest"), get(latest_backup))
        .route(&internal("/restore"), post(restore_latest))
        .route(&internal("/restore/:oid"), post(restore_oid))
        // Everything outside the internal prefix is a file path.
        .fallback(file_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn internal(path: &str) -> String {
    format!("{}{}", INTERNAL_PREFIX, path)
}

pub async fn run_server(config: Config) -> Result<()> {
    let registry = config.registry.builder().build().await?;
    let options: NodeOptions = config.node_options();
    let services = NodeServices::open(options, config.cluster.clone(), registry).await?;

    let state = Arc::new(ServerState { services });

    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        heartbeat_loop(heartbeat_state).await;
    });
    let settings_state = state.clone();
    tokio::spawn(async move {
        settings_reload_loop(settings_state).await;
    });
    let reconcile_state = state.clone();
    tokio::spawn(async move {
        reconcile_loop(reconcile_state).await;
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!("Server listening on {}", config.node.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn heartbeat_loop(state: Arc<ServerState>) {
    let stale_after = state.services.settings.snapshot().node_stale_after_secs;
    let period = Duration::from_secs((stale_after / 3).max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        if let Err(e) = state.services.heartbeat().await {
            tracing::warn!("Failed to refresh registration: {}", e);
        }
    }
}

async fn settings_reload_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(SETTINGS_RELOAD_INTERVAL);

    loop {
        interval.tick().await;
        match state.services.reload_settings().await {
            Ok(true) => tracing::info!("Cluster settings reloaded"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to reload cluster settings: {}", e),
        }
    }
}

async fn reconcile_loop(state: Arc<ServerState>) {
    loop {
        // Re-read each round so a settings change takes effect.
        let period = state.services.settings.snapshot().reconcile_interval();
        tokio::time::sleep(period).await;

        if let Err(e) = state.services.replication.reconcile_once(RECONCILE_BATCH).await {
            tracing::error!("Replica reconcile failed: {}", e);
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let services = &state.services;
    let response = HealthResponse {
        node_id: services.local.node_id.clone(),
        address: services.local.address.clone(),
        min_replicas: services.settings.snapshot().min_replicas,
        queue_capacity: services.dispatcher.capacity(),
    };

    (StatusCode::OK, Json(response))
}

async fn list_nodes(State(state): State<Arc<ServerState>>) -> Response {
    match state.services.registry.get_nodes().await {
        Ok(nodes) => ApiResponse::respond(StatusCode::OK, nodes),
        Err(e) => failure(e),
    }
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Response {
    let settings = state.services.settings.snapshot();
    ApiResponse::respond(StatusCode::OK, settings.as_ref().clone())
}

async fn put_config(
    State(state): State<Arc<ServerState>>,
    Json(next): Json<ClusterSettings>,
) -> Response {
    match state.services.update_settings(next).await {
        Ok(settings) => {
            tracing::info!("Cluster settings updated: {:?}", settings);
            ApiResponse::respond(StatusCode::OK, settings)
        }
        Err(e) => failure(e),
    }
}

async fn get_meta(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    let request = ReadFileOperationRequest {
        path,
        include_body: false,
    };
    match state.services.read_file.run(request).await {
        Ok(ReadFileOperationOutcome::Found(result)) => {
            ApiResponse::respond(StatusCode::OK, result.meta)
        }
        Ok(ReadFileOperationOutcome::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "file not found")
        }
        Err(e) => failure(e),
    }
}

async fn list_root(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    list_files(&state, String::new(), query).await
}

async fn list_path(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    list_files(&state, path, query).await
}

async fn list_files(state: &ServerState, path: String, query: ListQuery) -> Response {
    let request = ListFilesOperationRequest {
        path,
        include_meta: flag(query.include_meta.as_deref()),
        depth: query.depth,
    };
    match state.services.list_files.run(request).await {
        Ok(listing) => ApiResponse::respond(StatusCode::OK, listing),
        Err(e) => failure(e),
    }
}

async fn get_blob(State(state): State<Arc<ServerState>>, Path(oid): Path<String>) -> Response {
    let blobs = &state.services.blobs;
    let length = match blobs.blob_len(&oid).await {
        Ok(length) => length,
        Err(e) => return failure(e),
    };
    let file = match blobs.open(&oid).await {
        Ok(file) => file,
        Err(e) => return failure(e),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    (
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

/// Replication instruction from a peer: queue a pull of `oid` from the named
/// source and acknowledge immediately.
async fn fetch_blob(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
    Query(query): Query<FetchQuery>,
) -> Response {
    if let Err(e) = validate_oid(&oid) {
        return failure(e);
    }
    let Some(from) = query.from.filter(|from| !from.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing source node");
    };

    let source = match resolve_source(&state, &from, query.addr).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown source node: {}", from),
            );
        }
        Err(e) => return failure(e),
    };

    let task = InternodeTask::PullBlob {
        source,
        oid: oid.clone(),
    };
    match state.services.dispatcher.submit(task).await {
        Ok(()) => {
            tracing::debug!("Queued pull of {} from {}", oid, from);
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => failure(e),
    }
}

async fn resolve_source(
    state: &ServerState,
    node_id: &str,
    addr: Option<String>,
) -> Result<Option<NodeInfo>> {
    let nodes = state.services.registry.get_nodes().await?;
    if let Some(node) = nodes.into_iter().find(|node| node.node_id == node_id) {
        return Ok(Some(node));
    }

    Ok(addr
        .filter(|addr| !addr.is_empty())
        .map(|addr| NodeInfo::new(node_id, addr)))
}

async fn replica_status(
    State(state): State<Arc<ServerState>>,
    Path(oid): Path<String>,
) -> Response {
    if let Err(e) = validate_oid(&oid) {
        return failure(e);
    }
    match state.services.replication.replica_status(&oid).await {
        Ok(status) => ApiResponse::respond(StatusCode::OK, status),
        Err(e) => failure(e),
    }
}

async fn backup(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<BackupQuery>,
) -> Response {
    let Some(name) = query.name.filter(|name| !name.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing fn parameter");
    };
    let request = BackupOperationRequest { name };

    if flag(query.bg.as_deref()) {
        let operation = state.services.backup.clone();
        tokio::spawn(async move {
            if let Err(e) = operation.run(request).await {
                tracing::error!("Error performing background backup: {}", e);
            }
        });
        return StatusCode::ACCEPTED.into_response();
    }

    match state.services.backup.run(request).await {
        Ok(result) => ApiResponse::respond(StatusCode::CREATED, result),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error performing backup: {}", e),
        ),
    }
}

async fn mark_backup(State(state): State<Arc<ServerState>>, Path(oid): Path<String>) -> Response {
    match record_backup_marker(state.services.blobs.root(), &oid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error marking backup: {}", e),
        ),
    }
}

async fn latest_backup(State(state): State<Arc<ServerState>>) -> Response {
    match latest_backup_marker(state.services.blobs.root()).await {
        Ok(Some(oid)) => ApiResponse::respond(StatusCode::OK, BackupMarkerResponse { oid }),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no backup has been recorded"),
        Err(e) => failure(e),
    }
}

async fn restore_latest(State(state): State<Arc<ServerState>>) -> Response {
    restore(&state, None).await
}

async fn restore_oid(State(state): State<Arc<ServerState>>, Path(oid): Path<String>) -> Response {
    restore(&state, Some(oid)).await
}

async fn restore(state: &ServerState, oid: Option<String>) -> Response {
    match state
        .services
        .restore
        .run(RestoreBackupOperationRequest { oid })
        .await
    {
        Ok(result) => ApiResponse::respond(StatusCode::OK, result),
        Err(e) => failure(e),
    }
}

async fn file_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = uri.path();
    if path == INTERNAL_PREFIX || path.starts_with(&format!("{}/", INTERNAL_PREFIX)) {
        return error_response(StatusCode::NOT_FOUND, "unknown internal endpoint");
    }

    match method {
        Method::GET => read_file(&state, path, true).await,
        Method::HEAD => read_file(&state, path, false).await,
        Method::PUT => put_file(&state, path, query, &headers, body).await,
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

async fn read_file(state: &ServerState, path: &str, include_body: bool) -> Response {
    let request = ReadFileOperationRequest {
        path: path.to_string(),
        include_body,
    };
    let result = match state.services.read_file.run(request).await {
        Ok(ReadFileOperationOutcome::Found(result)) => result,
        Ok(ReadFileOperationOutcome::NotFound) => {
            return error_response(StatusCode::NOT_FOUND, "file not found");
        }
        Err(e) => return failure(e),
    };

    let meta = result.meta;
    let mut headers = HeaderMap::new();
    let content_type = meta.content_type().unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.length));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", meta.oid)) {
        headers.insert(header::ETAG, etag);
    }

    let body = match result.body {
        Some(file) => Body::from_stream(ReaderStream::new(file)),
        None => Body::empty(),
    };
    (StatusCode::OK, headers, body).into_response()
}

async fn put_file(
    state: &ServerState,
    path: &str,
    query: FileQuery,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let retention = match query.revs.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(count) => match RevisionRetention::from_count(count) {
                Ok(retention) => Some(retention),
                Err(e) => return failure(e),
            },
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid revs value: {}", raw),
                );
            }
        },
    };

    let userdata = match headers.get(USERDATA_HEADER) {
        None => None,
        Some(value) => match serde_json::from_slice(value.as_bytes()) {
            Ok(userdata) => Some(userdata),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid {} header: {}", USERDATA_HEADER, e),
                );
            }
        },
    };

    let mut stored = Headers::new();
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        stored.insert(
            "Content-Type".to_string(),
            vec![content_type.to_string()],
        );
    }

    let request = PutFileOperationRequest {
        path: path.to_string(),
        headers: stored,
        userdata,
        retention,
    };
    match state
        .services
        .put_file
        .run(request, body.into_data_stream())
        .await
    {
        Ok(result) => {
            tracing::debug!("stored {} as {}", result.path, result.meta.oid);
            ApiResponse::respond(StatusCode::CREATED, result.meta)
        }
        Err(e) => failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use cairn_core::storage::{CasOutcome, KvStore, MemoryKv, Versioned};
    use cairn_core::{KvNamespaces, MetadataBackend, StaticRegistry};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<ServerState>, tempfile::TempDir) {
        test_app_with(KvNamespaces::in_memory()).await
    }

    async fn test_app_with(
        namespaces: KvNamespaces,
    ) -> (Router, Arc<ServerState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let options = NodeOptions {
            node_id: "node-a".to_string(),
            address: "127.0.0.1:1".to_string(),
            root: dir.path().to_path_buf(),
            metadata_backend: MetadataBackend::Memory,
            metadata_path: None,
            workers: 2,
            queue_per_worker: 16,
        };
        let registry = Arc::new(StaticRegistry::new(Vec::new()));
        let services = NodeServices::with_namespaces(
            options,
            namespaces,
            ClusterSettings::default(),
            registry,
        )
        .await
        .unwrap();

        let state = Arc::new(ServerState { services });
        (router(state.clone()), state, dir)
    }

    /// File namespace whose scans always fail, counting each attempt.
    #[derive(Default)]
    struct UnscannableKv {
        inner: MemoryKv,
        failed_scans: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KvStore for UnscannableKv {
        async fn get(&self, key: &str) -> cairn_core::Result<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn get_many(
            &self,
            keys: &[String],
        ) -> cairn_core::Result<BTreeMap<String, Versioned>> {
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
            _: Option<&str>,
            _: usize,
        ) -> cairn_core::Result<Vec<(String, Versioned)>> {
            self.failed_scans.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::Internal("files namespace unavailable".to_string()))
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_file() {
        let (app, _state, _dir) = test_app().await;

        let put = Request::builder()
            .method(Method::PUT)
            .uri("/docs/a.txt")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(USERDATA_HEADER, r#"{"owner":"ops"}"#)
            .body(Body::from("hello"))
            .unwrap();
        let response = send(&app, put).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(created["success"], true);
        assert_eq!(created["data"]["length"], 5);

        let get = Request::builder().uri("/docs/a.txt").body(Body::empty()).unwrap();
        let response = send(&app, get).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(body_bytes(response).await, b"hello");

        let meta = Request::builder()
            .uri("/.cairn/meta/docs/a.txt")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, meta).await;
        assert_eq!(response.status(), StatusCode::OK);
        let meta: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(meta["data"]["userdata"]["owner"], "ops");
    }

    #[tokio::test]
    async fn test_missing_file_and_bad_revs() {
        let (app, _state, _dir) = test_app().await;

        let get = Request::builder().uri("/nope.txt").body(Body::empty()).unwrap();
        assert_eq!(send(&app, get).await.status(), StatusCode::NOT_FOUND);

        let put = Request::builder()
            .method(Method::PUT)
            .uri("/a.txt?revs=-3")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(send(&app, put).await.status(), StatusCode::BAD_REQUEST);

        let put = Request::builder()
            .method(Method::PUT)
            .uri("/a.txt?revs=lots")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(send(&app, put).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backup_status_codes() {
        let (app, _state, _dir) = test_app().await;

        assert_eq!(
            send(&app, post("/.cairn/backup")).await.status(),
            StatusCode::BAD_REQUEST
        );
        // background requests are accepted even when the backup later fails
        assert_eq!(
            send(&app, post("/.cairn/backup?fn=../bad&bg=true")).await.status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            send(&app, post("/.cairn/backup?fn=../bad")).await.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let response = send(&app, post("/.cairn/backup?fn=backups/one.json.gz&bg=0")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        let oid = created["data"]["oid"].as_str().unwrap().to_string();

        let latest = Request::builder()
            .uri("/.cairn/backup/latest")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, latest).await;
        assert_eq!(response.status(), StatusCode::OK);
        let latest: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(latest["data"]["oid"], oid);
    }

    #[tokio::test]
    async fn test_background_backup_failure_leaves_no_trace() {
        let files = Arc::new(UnscannableKv::default());
        let namespaces = KvNamespaces {
            files: files.clone(),
            ..KvNamespaces::in_memory()
        };
        let (app, state, dir) = test_app_with(namespaces).await;

        assert_eq!(
            send(&app, post("/.cairn/backup?fn=backups/bg.json.gz&bg=true"))
                .await
                .status(),
            StatusCode::ACCEPTED
        );

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while files.failed_scans.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(latest_backup_marker(dir.path()).await.unwrap(), None);
        let stray: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .chain(std::fs::read_dir(dir.path()).unwrap())
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .collect();
        assert!(stray.is_empty());
        assert!(
            state
                .services
                .metadata
                .get("backups/bg.json.gz")
                .await
                .unwrap()
                .is_none()
        );

        let response = send(&app, post("/.cairn/backup?fn=backups/bg.json.gz")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let failed: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(failed["success"], false);
    }

    #[tokio::test]
    async fn test_mark_backup() {
        let (app, _state, _dir) = test_app().await;

        let latest = || {
            Request::builder()
                .uri("/.cairn/backup/latest")
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(send(&app, latest()).await.status(), StatusCode::NOT_FOUND);

        assert_eq!(
            send(&app, post("/.cairn/backup/mark/not-hex")).await.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            send(&app, post("/.cairn/backup/mark/abcd01")).await.status(),
            StatusCode::NO_CONTENT
        );

        let response = send(&app, latest()).await;
        let latest: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(latest["data"]["oid"], "abcd01");
    }

    #[tokio::test]
    async fn test_fetch_requires_known_source() {
        let (app, _state, _dir) = test_app().await;

        assert_eq!(
            send(&app, post("/.cairn/fetch/abcd?from=ghost")).await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            send(&app, post("/.cairn/fetch/xyz?from=node-b")).await.status(),
            StatusCode::BAD_REQUEST
        );
        // an explicit address is enough to reach an unregistered peer
        assert_eq!(
            send(&app, post("/.cairn/fetch/abcd?from=node-b&addr=127.0.0.1:1"))
                .await
                .status(),
            StatusCode::ACCEPTED
        );
    }

    #[tokio::test]
    async fn test_list_and_config() {
        let (app, _state, _dir) = test_app().await;

        for path in ["/a/one.txt", "/a/two.txt", "/b.txt"] {
            let put = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::from(path.to_string()))
                .unwrap();
            assert_eq!(send(&app, put).await.status(), StatusCode::CREATED);
        }

        let list = Request::builder()
            .uri("/.cairn/list")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, list).await;
        assert_eq!(response.status(), StatusCode::OK);
        let listing: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(listing["data"]["files"].get("b.txt").is_some());
        assert_eq!(listing["data"]["dirs"]["a"]["descendants"], 2);

        let mut settings = ClusterSettings::default();
        settings.min_replicas = 2;
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/.cairn/config")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&settings).unwrap()))
            .unwrap();
        assert_eq!(send(&app, put).await.status(), StatusCode::OK);

        let mut unbounded = settings.clone();
        unbounded.node_stale_after_secs = 10_000_000_000_000_000;
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/.cairn/config")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&unbounded).unwrap()))
            .unwrap();
        assert_eq!(send(&app, put).await.status(), StatusCode::BAD_REQUEST);

        settings.hash = cairn_core::HashAlgorithm::Sha512;
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/.cairn/config")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&settings).unwrap()))
            .unwrap();
        assert_eq!(send(&app, put).await.status(), StatusCode::BAD_REQUEST);

        let get = Request::builder()
            .uri("/.cairn/config")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, get).await;
        let config: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(config["data"]["min_replicas"], 2);
        assert_eq!(config["data"]["hash"], "sha256");
    }
}
