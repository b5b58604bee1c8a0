//! Content-addressed storage for handler output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::ContentHash;
use crate::errors::ResultStoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResult {
    pub hash: ContentHash,
    pub location: String,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store `bytes` under their hash. Storing the same bytes twice is a no-op.
    async fn put(&self, bytes: &[u8]) -> Result<StoredResult, ResultStoreError>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, ResultStoreError>;
}

/// Objects live at `root/<first two hex chars>/<remaining hex>`.
#[derive(Clone, Debug)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.hex();
        let split = hex.len().min(2);
        self.root.join(&hex[..split]).join(&hex[split..])
    }
}

fn io_error(path: &Path, error: std::io::Error) -> ResultStoreError {
    ResultStoreError::Io { path: path.display().to_string(), message: error.to_string() }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn put(&self, bytes: &[u8]) -> Result<StoredResult, ResultStoreError> {
        let hash = ContentHash::of_bytes(bytes);
        let path = self.object_path(&hash);
        let location = path.display().to_string();

        if tokio::fs::try_exists(&path).await.map_err(|error| io_error(&path, error))? {
            return Ok(StoredResult { hash, location });
        }

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|error| io_error(&dir, error))?;

        let temp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file =
            tokio::fs::File::create(&temp).await.map_err(|error| io_error(&temp, error))?;
        file.write_all(bytes).await.map_err(|error| io_error(&temp, error))?;
        file.sync_all().await.map_err(|error| io_error(&temp, error))?;
        drop(file);

        if let Err(error) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&path, error));
        }

        Ok(StoredResult { hash, location })
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, ResultStoreError> {
        let path = self.object_path(hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error(&path, error)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryResultStore {
    objects: Arc<RwLock<HashMap<ContentHash, Vec<u8>>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, bytes: &[u8]) -> Result<StoredResult, ResultStoreError> {
        let hash = ContentHash::of_bytes(bytes);
        self.objects.write().await.entry(hash.clone()).or_insert_with(|| bytes.to_vec());
        let location = format!("memory://{hash}");
        Ok(StoredResult { hash, location })
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, ResultStoreError> {
        Ok(self.objects.read().await.get(hash).cloned())
    }
}
