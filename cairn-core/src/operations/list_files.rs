use crate::index::DynMetadataIndex;
use crate::{CairnError, FileMeta, MetadataStore, Result, normalize_path};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct ListFilesOperation {
    metadata: MetadataStore,
    index: DynMetadataIndex,
}

#[derive(Debug, Clone)]
pub struct ListFilesOperationRequest {
    /// Directory to list, empty for the root.
    pub path: String,
    pub include_meta: bool,
    pub depth: usize,
}

/// A listed file. Serializes to `{}` unless metadata was requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedFile {
    #[serde(flatten)]
    pub meta: Option<FileMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirSummary {
    pub descendants: u64,
    pub size: u64,
    pub smallest: u64,
    pub largest: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileListing {
    pub path: String,
    pub files: BTreeMap<String, ListedFile>,
    pub dirs: BTreeMap<String, DirSummary>,
}

impl ListFilesOperation {
    pub fn new(metadata: MetadataStore, index: DynMetadataIndex) -> Self {
        Self { metadata, index }
    }

    pub async fn run(&self, request: ListFilesOperationRequest) -> Result<FileListing> {
        let ListFilesOperationRequest {
            path,
            include_meta,
            depth,
        } = request;

        if depth == 0 {
            return Err(CairnError::InvalidRequest(
                "listing depth must be at least 1".to_string(),
            ));
        }

        let path = if path.trim_matches('/').is_empty() {
            String::new()
        } else {
            normalize_path(&path)?
        };
        let prefix: Vec<String> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').map(str::to_string).collect()
        };

        let group_level = prefix.len().checked_add(depth).ok_or_else(|| {
            CairnError::InvalidRequest(format!("listing depth {} is too large", depth))
        })?;
        let rows = self.index.browse(&prefix, group_level).await?;
        let keys: Vec<String> = rows.iter().map(|row| row.key.join("/")).collect();
        let found = self.metadata.get_raw_many(&keys).await?;

        let mut files = BTreeMap::new();
        let mut dirs = BTreeMap::new();
        for (row, key) in rows.iter().zip(keys.iter()) {
            let name_start = row.key.len().saturating_sub(depth);
            let name = row.key[name_start..].join("/");

            match found.get(key) {
                Some(raw) => match FileMeta::decode(raw) {
                    Some(meta) => {
                        files.insert(
                            name,
                            ListedFile {
                                meta: include_meta.then_some(meta),
                            },
                        );
                    }
                    None => {
                        tracing::warn!("skipping undecodable file record {}", key);
                    }
                },
                None => {
                    dirs.insert(
                        name,
                        DirSummary {
                            descendants: row.stats.count,
                            size: row.stats.sum,
                            smallest: row.stats.min,
                            largest: row.stats.max,
                        },
                    );
                }
            }
        }

        Ok(FileListing {
            path: format!("/{}", path),
            files,
            dirs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::LocalIndex;
    use crate::storage::kv::MemoryKv;
    use crate::{Headers, RevisionRetention};
    use std::sync::Arc;

    async fn setup() -> ListFilesOperation {
        let files = Arc::new(MemoryKv::new());
        let metadata = MetadataStore::new(files.clone());
        for (path, length) in [
            ("docs/readme.md", 10),
            ("docs/img/a.png", 100),
            ("docs/img/b.png", 300),
            ("docs/img/raw/c.tiff", 50),
            ("notes.txt", 1),
        ] {
            metadata
                .update(
                    path,
                    FileMeta::new("ab", length, Headers::new()),
                    RevisionRetention::Limited(0),
                )
                .await
                .unwrap();
        }
        let index = Arc::new(LocalIndex::new(files, Arc::new(MemoryKv::new())));
        ListFilesOperation::new(metadata, index)
    }

    #[tokio::test]
    async fn test_list_splits_files_and_dirs() {
        let op = setup().await;
        let listing = op
            .run(ListFilesOperationRequest {
                path: "/docs/".to_string(),
                include_meta: false,
                depth: 1,
            })
            .await
            .unwrap();

        assert_eq!(listing.path, "/docs");
        assert_eq!(listing.files.keys().collect::<Vec<_>>(), vec!["readme.md"]);
        assert_eq!(listing.files["readme.md"].meta, None);
        assert_eq!(
            listing.dirs["img"],
            DirSummary {
                descendants: 3,
                size: 450,
                smallest: 50,
                largest: 300,
            }
        );

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["files"]["readme.md"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_list_root_with_depth_two_and_meta() {
        let op = setup().await;
        let listing = op
            .run(ListFilesOperationRequest {
                path: String::new(),
                include_meta: true,
                depth: 2,
            })
            .await
            .unwrap();

        assert_eq!(listing.path, "/");
        assert_eq!(
            listing.files.keys().collect::<Vec<_>>(),
            vec!["docs/readme.md", "notes.txt"]
        );
        assert_eq!(listing.files["notes.txt"].meta.as_ref().unwrap().length, 1);
        assert_eq!(listing.dirs.keys().collect::<Vec<_>>(), vec!["docs/img"]);
        assert!(op
            .run(ListFilesOperationRequest {
                path: String::new(),
                include_meta: false,
                depth: 0,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unbounded_depth_under_a_prefix() {
        let op = setup().await;
        let err = op
            .run(ListFilesOperationRequest {
                path: "docs".to_string(),
                include_meta: false,
                depth: usize::MAX,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CairnError::InvalidRequest(_)));

        // at the root the same depth just lists every file by full path
        let listing = op
            .run(ListFilesOperationRequest {
                path: String::new(),
                include_meta: false,
                depth: usize::MAX,
            })
            .await
            .unwrap();
        assert_eq!(listing.files.len(), 5);
        assert!(listing.dirs.is_empty());
    }
}
