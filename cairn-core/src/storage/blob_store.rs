use crate::{CairnError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use ulid::Ulid;

const TMP_DIR: &str = "tmp";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> String {
        let mut hasher = BlobHasher::new(self);
        hasher.update(data);
        hasher.finalize_hex()
    }
}

enum BlobHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl BlobHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Sha512(hasher) => hasher.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Content-addressed blob directory: every blob lives at `<root>/<oid>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl BlobStore {
    /// Creates `root` and its temp directory if needed.
    pub fn new(root: PathBuf, algorithm: HashAlgorithm) -> Result<Self> {
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root, algorithm })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Where `oid` lives on disk, whether or not it exists yet.
    pub fn blob_path(&self, oid: &str) -> Result<PathBuf> {
        validate_oid(oid)?;
        Ok(self.root.join(oid))
    }

    /// True when the blob file is present. Malformed ids are never present.
    pub fn contains(&self, oid: &str) -> bool {
        self.blob_path(oid).map(|path| path.is_file()).unwrap_or(false)
    }

    /// Opens a blob for reading, mapping a missing file to `BlobNotFound`.
    pub async fn open(&self, oid: &str) -> Result<fs::File> {
        let path = self.blob_path(oid)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::BlobNotFound(oid.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Size in bytes of a stored blob.
    pub async fn blob_len(&self, oid: &str) -> Result<u64> {
        let path = self.blob_path(oid)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::BlobNotFound(oid.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// A recorder that files content under whatever oid it hashes to.
    pub fn recorder(&self) -> HashRecorder {
        HashRecorder {
            root: self.root.clone(),
            algorithm: self.algorithm,
            expected: None,
        }
    }

    /// A recorder that refuses to commit content not hashing to `oid`.
    pub fn verifying_recorder(&self, oid: &str) -> Result<HashRecorder> {
        validate_oid(oid)?;
        Ok(HashRecorder {
            root: self.root.clone(),
            algorithm: self.algorithm,
            expected: Some(oid.to_string()),
        })
    }
}

/// Blob ids are non-empty hex strings.
pub fn validate_oid(oid: &str) -> Result<()> {
    if oid.is_empty() || !oid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CairnError::InvalidRequest(format!("invalid blob id: {}", oid)));
    }
    Ok(())
}

/// Streams bytes into a temp file while hashing them, then moves the file to
/// its content address.
pub struct HashRecorder {
    root: PathBuf,
    algorithm: HashAlgorithm,
    expected: Option<String>,
}

impl HashRecorder {
    pub async fn process<R>(&self, reader: R) -> Result<(String, u64)>
    where
        R: AsyncRead + Unpin,
    {
        self.stage(reader).await?.commit().await
    }

    pub async fn process_stream<S, E>(&self, stream: S) -> Result<(String, u64)>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        self.stage_stream(stream).await?.commit().await
    }

    /// Writes and hashes everything without publishing it. The caller decides
    /// whether to `commit` the result; dropping it discards the temp file.
    pub async fn stage<R>(&self, mut reader: R) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.start().await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        self.finish(writer).await
    }

    pub async fn stage_stream<S, E>(&self, mut stream: S) -> Result<StagedBlob>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut writer = self.start().await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| {
                CairnError::Io(std::io::Error::other(format!(
                    "body stream failed: {}",
                    error
                )))
            })?;
            writer.write(&chunk).await?;
        }
        self.finish(writer).await
    }

    async fn start(&self) -> Result<StagingWriter> {
        let temp = TempFile {
            path: Some(
                self.root
                    .join(TMP_DIR)
                    .join(format!("{}.tmp", Ulid::new())),
            ),
        };
        let file = fs::File::create(temp.path()?).await?;

        Ok(StagingWriter {
            file,
            hasher: BlobHasher::new(self.algorithm),
            length: 0,
            temp,
        })
    }

    async fn finish(&self, writer: StagingWriter) -> Result<StagedBlob> {
        let StagingWriter {
            mut file,
            hasher,
            length,
            temp,
        } = writer;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let oid = hasher.finalize_hex();
        if let Some(expected) = &self.expected {
            if !expected.eq_ignore_ascii_case(&oid) {
                return Err(CairnError::HashMismatch {
                    expected: expected.clone(),
                    actual: oid,
                });
            }
        }

        Ok(StagedBlob {
            final_path: self.root.join(&oid),
            oid,
            length,
            temp,
        })
    }
}

struct StagingWriter {
    file: fs::File,
    hasher: BlobHasher,
    length: u64,
    temp: TempFile,
}

impl StagingWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.file.write_all(data).await?;
        self.length += data.len() as u64;
        Ok(())
    }
}

/// Fully written and hashed content still sitting in the temp directory.
pub struct StagedBlob {
    oid: String,
    length: u64,
    final_path: PathBuf,
    temp: TempFile,
}

impl StagedBlob {
    pub fn oid(&self) -> &str {
        &self.oid
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub async fn commit(mut self) -> Result<(String, u64)> {
        let temp_path = self.temp.path()?.to_path_buf();

        if fs::try_exists(&self.final_path).await? {
            fs::remove_file(&temp_path).await?;
            tracing::debug!("blob {} already present, discarded duplicate", self.oid);
        } else {
            fs::rename(&temp_path, &self.final_path).await?;
            tracing::debug!("stored blob {} ({} bytes)", self.oid, self.length);
        }
        self.temp.take()?;

        Ok((std::mem::take(&mut self.oid), self.length))
    }
}

struct TempFile {
    path: Option<PathBuf>,
}

impl TempFile {
    fn path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| CairnError::Internal("temp file already consumed".to_string()))
    }

    fn take(&mut self) -> Result<PathBuf> {
        self.path
            .take()
            .ok_or_else(|| CairnError::Internal("temp file already consumed".to_string()))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
