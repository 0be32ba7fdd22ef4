use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("CAS conflict on key {0}")]
    CasConflict(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Peer {node} answered with status {status}")]
    PeerStatus { node: String, status: u16 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for CairnError {
    fn from(error: reqwest::Error) -> Self {
        CairnError::Http(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CairnError>;
