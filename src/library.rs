use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::error::AppError;
use crate::index::{BlobCleanup, ImageIndex, ImageRecord, JsonIndex, ListingIndex, Removal, upload_time_of};
use crate::media::{get_extension_from_mime_type, get_mime_type_from_extension};
use crate::storage::{BlobStore, GitHubStorage, LocalFileStorage};

/// An image as received from a client, before it is stored.
pub struct NewImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Pairs a blob store with the index describing its contents.
pub struct ImageLibrary {
    store: Arc<dyn BlobStore>,
    index: Box<dyn ImageIndex>,
}

impl ImageLibrary {
    pub fn new(store: Arc<dyn BlobStore>, index: Box<dyn ImageIndex>) -> Self {
        Self { store, index }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.backend {
            BackendKind::Local => {
                let store: Arc<dyn BlobStore> = Arc::new(LocalFileStorage::new(
                    config.blob_dir(),
                    config.files_base_url.clone(),
                    config.storage_timeout,
                ));
                let index = JsonIndex::new(config.index_path(), store.clone());
                Ok(Self::new(store, Box::new(index)))
            }
            BackendKind::GitHub => {
                let github = config
                    .github
                    .as_ref()
                    .context("github backend selected without GitHub settings")?;
                let store: Arc<dyn BlobStore> = Arc::new(
                    GitHubStorage::new(github, config.storage_timeout, config.storage_retries)
                        .context("failed to build GitHub client")?,
                );
                let index = ListingIndex::new(store.clone());
                Ok(Self::new(store, Box::new(index)))
            }
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Writes the blob, then records it. A failed blob write leaves the index
    /// untouched and a failed index write removes the blob again.
    pub async fn upload(&self, image: NewImage) -> Result<ImageRecord, AppError> {
        if image.bytes.is_empty() {
            return Err(AppError::invalid_input("uploaded file is empty"));
        }
        let ext = get_extension_from_mime_type(&image.mime_type).ok_or_else(|| {
            AppError::invalid_input(format!("unsupported image type: {}", image.mime_type))
        })?;
        let id = Uuid::now_v7();
        let file_name = format!("{id}.{ext}");
        let stored = self.store.put(&file_name, &image.bytes, &image.name).await?;

        let record = ImageRecord {
            id,
            name: image.name,
            file_name,
            url: stored.url,
            size: stored.size,
            mime_type: get_mime_type_from_extension(ext)
                .map(str::to_string)
                .unwrap_or(image.mime_type),
            upload_time: upload_time_of(&id).unwrap_or_else(Utc::now),
            github_url: stored.page_url,
        };
        let record = match self.index.insert(record.clone()).await {
            Ok(indexed) => indexed,
            Err(err) => {
                self.discard_blob(&record.file_name).await;
                return Err(err.into());
            }
        };
        info!(id = %record.id, file_name = %record.file_name, size = record.size, "stored image");
        Ok(record)
    }

    async fn discard_blob(&self, key: &str) {
        match self.store.delete(key).await {
            Ok(_) => warn!(key, "index write failed, removed the uploaded blob"),
            Err(err) => warn!(
                key,
                error = %err,
                "index write failed, uploaded blob is orphaned"
            ),
        }
    }

    pub async fn list(&self) -> Result<Vec<ImageRecord>, AppError> {
        Ok(self.index.list().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<ImageRecord, AppError> {
        self.index
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("image not found"))
    }

    pub async fn delete(&self, id: Uuid) -> Result<Removal, AppError> {
        let removal = self
            .index
            .remove(id)
            .await?
            .ok_or_else(|| AppError::not_found("image not found"))?;
        match &removal.blob {
            BlobCleanup::Failed(err) => warn!(
                id = %id,
                file_name = %removal.record.file_name,
                error = %err,
                "record removed but blob could not be deleted"
            ),
            _ => info!(id = %id, file_name = %removal.record.file_name, "deleted image"),
        }
        Ok(removal)
    }
}
