use crate::storage::kv::{CasOutcome, DynKvStore, MAX_CAS_ATTEMPTS, update_with_retry};
use crate::{CairnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Headers = BTreeMap<String, Vec<String>>;

/// Discriminator stored in every metadata document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    #[default]
    File,
    Blob,
}

/// Current state of a logical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(rename = "type")]
    pub kind: DocKind,
    #[serde(default)]
    pub headers: Headers,
    pub oid: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<serde_json::Value>,
    pub modified: DateTime<Utc>,
    #[serde(rename = "older", default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PrevMeta>,
    #[serde(default)]
    pub revno: u64,
}

/// Snapshot of an earlier revision kept in `FileMeta::previous`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrevMeta {
    #[serde(default)]
    pub headers: Headers,
    pub oid: String,
    pub length: u64,
    pub modified: DateTime<Utc>,
    pub revno: u64,
}

impl FileMeta {
    pub fn new(oid: impl Into<String>, length: u64, headers: Headers) -> Self {
        Self {
            kind: DocKind::File,
            headers,
            oid: oid.into(),
            length,
            userdata: None,
            modified: Utc::now(),
            previous: Vec::new(),
            revno: 0,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn snapshot(&self) -> PrevMeta {
        PrevMeta {
            headers: self.headers.clone(),
            oid: self.oid.clone(),
            length: self.length,
            modified: self.modified,
            revno: self.revno,
        }
    }

    /// Decodes a stored document, `None` for anything that is not a file record.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<FileMeta>(raw) {
            Ok(meta) if meta.kind == DocKind::File => Some(meta),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!("ignoring undecodable file metadata: {}", error);
                None
            }
        }
    }
}

/// How many earlier revisions a path keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RevisionRetention {
    Limited(usize),
    Unlimited,
}

impl RevisionRetention {
    pub fn from_count(count: i64) -> Result<Self> {
        match count {
            -1 => Ok(Self::Unlimited),
            n if n >= 0 => Ok(Self::Limited(n as usize)),
            n => Err(CairnError::InvalidRequest(format!(
                "revision retention must be -1 or >= 0, got {}",
                n
            ))),
        }
    }

    pub fn as_count(self) -> i64 {
        match self {
            Self::Limited(n) => n as i64,
            Self::Unlimited => -1,
        }
    }
}

impl TryFrom<i64> for RevisionRetention {
    type Error = CairnError;

    fn try_from(count: i64) -> Result<Self> {
        Self::from_count(count)
    }
}

impl From<RevisionRetention> for i64 {
    fn from(retention: RevisionRetention) -> Self {
        retention.as_count()
    }
}

/// Builds the record that replaces `existing` when `proposed` is written.
pub fn next_revision(
    existing: Option<&FileMeta>,
    mut proposed: FileMeta,
    retention: RevisionRetention,
) -> FileMeta {
    proposed.kind = DocKind::File;

    let Some(existing) = existing else {
        proposed.revno = 0;
        return proposed;
    };

    if proposed.userdata.is_none() {
        proposed.userdata = existing.userdata.clone();
    }
    proposed.revno = existing.revno + 1;

    if retention != RevisionRetention::Limited(0) {
        let mut previous = existing.previous.clone();
        previous.push(existing.snapshot());

        if let RevisionRetention::Limited(keep) = retention {
            let excess = previous.len().saturating_sub(keep);
            previous.drain(..excess);
        }
        proposed.previous = previous;
    }

    proposed
}

/// Versioned file metadata keyed by logical path.
#[derive(Clone)]
pub struct MetadataStore {
    kv: DynKvStore,
}

impl MetadataStore {
    pub fn new(kv: DynKvStore) -> Self {
        Self { kv }
    }

    /// Commits `proposed` as the next revision of `path`, retrying on
    /// concurrent modification.
    pub async fn update(
        &self,
        path: &str,
        proposed: FileMeta,
        retention: RevisionRetention,
    ) -> Result<FileMeta> {
        let raw = update_with_retry(self.kv.as_ref(), path, |current| {
            let existing = current.and_then(FileMeta::decode);
            let next = next_revision(existing.as_ref(), proposed.clone(), retention);
            Ok(serde_json::to_vec(&next)?)
        })
        .await?;

        let stored: FileMeta = serde_json::from_slice(&raw)?;
        tracing::debug!(
            "stored meta path={} oid={} revno={} previous={}",
            path,
            stored.oid,
            stored.revno,
            stored.previous.len()
        );
        Ok(stored)
    }

    /// Current metadata of `path`. Blob documents and undecodable values read as absent.
    pub async fn get(&self, path: &str) -> Result<Option<FileMeta>> {
        Ok(self
            .kv
            .get(path)
            .await?
            .and_then(|entry| FileMeta::decode(&entry.value)))
    }

    /// Stored documents for `paths`, undecoded. Missing paths are left out of the map.
    pub async fn get_raw_many(&self, paths: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(self
            .kv
            .get_many(paths)
            .await?
            .into_iter()
            .map(|(path, entry)| (path, entry.value))
            .collect())
    }

    /// One page of raw documents with keys after `after`, in key order.
    pub async fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .kv
            .scan(after, limit)
            .await?
            .into_iter()
            .map(|(path, entry)| (path, entry.value))
            .collect())
    }

    /// Installs a record taken from a backup. Returns false when the live
    /// record is at the same or a newer revision and was kept.
    pub async fn put_restored(&self, path: &str, meta: &FileMeta) -> Result<bool> {
        let encoded = serde_json::to_vec(meta)?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.kv.get(path).await?;
            if let Some(existing) = current.as_ref().and_then(|entry| FileMeta::decode(&entry.value))
            {
                if existing.revno >= meta.revno {
                    return Ok(false);
                }
            }

            let expected = current.as_ref().map(|entry| entry.cas);
            match self.kv.put_if(path, expected, encoded.clone()).await? {
                CasOutcome::Committed(_) => return Ok(true),
                CasOutcome::Conflict => continue,
            }
        }
        Err(CairnError::CasConflict(path.to_string()))
    }
}

/// Strips surrounding slashes and rejects empty, `.` and `..` components.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(CairnError::InvalidRequest(
            "file path cannot be empty".to_string(),
        ));
    }

    let mut components = Vec::new();
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(CairnError::InvalidRequest(format!(
                "invalid file path component: {}",
                component
            )));
        }
        components.push(component);
    }

    Ok(components.join("/"))
}
