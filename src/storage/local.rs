use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::error::StoreError;
use crate::storage::{BlobEntry, BlobRemoval, BlobStore};

/// Blob store backed by a flat directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    base_url: String,
    io_timeout: Duration,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, base_url: String, io_timeout: Duration) -> Self {
        Self {
            base_dir,
            base_url,
            io_timeout,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\'])
            && !key.contains("..");
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(Path::new(key)))
    }

    async fn timed<T>(
        &self,
        op: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.io_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.io_timeout)),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalFileStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, data: &[u8], _label: &str) -> Result<BlobEntry, StoreError> {
        let path = self.resolve_path(key)?;
        let partial = self.base_dir.join(format!(".{key}.part"));
        self.timed(async {
            fs::create_dir_all(&self.base_dir).await?;
            fs::write(&partial, data).await?;
            fs::rename(&partial, &path).await
        })
        .await?;
        Ok(BlobEntry {
            key: key.to_string(),
            size: data.len() as u64,
            url: self.public_url(key),
            page_url: None,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve_path(key)?;
        self.timed(async {
            match fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve_path(key)?;
        self.timed(async {
            match fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<BlobRemoval, StoreError> {
        let path = self.resolve_path(key)?;
        self.timed(async {
            match fs::remove_file(&path).await {
                Ok(()) => Ok(BlobRemoval::Deleted),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Ok(BlobRemoval::AlreadyMissing)
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn listing(&self) -> Result<Vec<BlobEntry>, StoreError> {
        let files = self
            .timed(async {
                let mut dir = match fs::read_dir(&self.base_dir).await {
                    Ok(dir) => dir,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err),
                };
                let mut files = Vec::new();
                while let Some(entry) = dir.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if !meta.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str() {
                        files.push((name.to_string(), meta.len()));
                    }
                }
                Ok::<_, std::io::Error>(files)
            })
            .await?;
        Ok(files
            .into_iter()
            .map(|(key, size)| BlobEntry {
                url: self.public_url(&key),
                key,
                size,
                page_url: None,
            })
            .collect())
    }

    fn public_url(&self, key: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        format!("{trimmed}/{key}")
    }
}
