pub mod github;
pub mod local;

pub use github::GitHubStorage;
pub use local::LocalFileStorage;

use crate::error::StoreError;

/// One regular file reported by [`BlobStore::listing`] or [`BlobStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
    pub url: String,
    /// Browsable page for the blob, when the backend hosts one.
    pub page_url: Option<String>,
}

/// Successful outcome of [`BlobStore::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRemoval {
    Deleted,
    AlreadyMissing,
}

/// Durable storage for raw image bytes, addressed by a generated key.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Stores `data` under `key` and describes the stored blob the way
    /// [`BlobStore::listing`] will. `label` is a human-readable description
    /// (the uploader's file name).
    async fn put(&self, key: &str, data: &[u8], label: &str) -> Result<BlobEntry, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<BlobRemoval, StoreError>;

    async fn listing(&self) -> Result<Vec<BlobEntry>, StoreError>;

    fn public_url(&self, key: &str) -> String;
}
