use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::index::{BlobCleanup, ImageIndex, ImageRecord, Removal};
use crate::storage::{BlobRemoval, BlobStore};

/// Index persisted as one JSON array next to the blobs it describes.
///
/// Every operation is a whole-document read-modify-write performed under a
/// single lock, so concurrent uploads and deletes cannot lose each other's
/// changes. `list` prunes records whose blob has disappeared.
pub struct JsonIndex {
    path: PathBuf,
    store: Arc<dyn BlobStore>,
    lock: Mutex<()>,
}

impl JsonIndex {
    pub fn new(path: PathBuf, store: Arc<dyn BlobStore>) -> Self {
        Self {
            path,
            store,
            lock: Mutex::new(()),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// A document that does not parse is moved to `*.corrupt` so the next
    /// save cannot destroy it.
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(records) => Ok(records),
            Err(err) => {
                let aside = self.sibling(".corrupt");
                fs::rename(&self.path, &aside).await?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "index is not valid JSON, starting empty"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, records: &[ImageRecord]) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = self.sibling(".tmp");
        fs::write(&staging, payload).await?;
        fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ImageIndex for JsonIndex {
    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let records = self.load().await?;
        let total = records.len();
        let mut kept = Vec::with_capacity(total);
        for record in records {
            if self.store.exists(&record.file_name).await? {
                kept.push(record);
            }
        }
        if kept.len() != total {
            warn!(pruned = total - kept.len(), "dropping index records whose blob is missing");
            self.save(&kept).await?;
        }
        Ok(kept)
    }

    async fn insert(&self, record: ImageRecord) -> Result<ImageRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.insert(0, record.clone());
        self.save(&records).await?;
        Ok(record)
    }

    async fn remove(&self, id: Uuid) -> Result<Option<Removal>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let Some(position) = records.iter().position(|record| record.id == id) else {
            return Ok(None);
        };
        let record = records.remove(position);
        let blob = match self.store.delete(&record.file_name).await {
            Ok(BlobRemoval::Deleted) => BlobCleanup::Deleted,
            Ok(BlobRemoval::AlreadyMissing) => {
                info!(file_name = %record.file_name, "blob was already gone");
                BlobCleanup::AlreadyMissing
            }
            Err(err) => BlobCleanup::Failed(err),
        };
        self.save(&records).await?;
        Ok(Some(Removal { record, blob }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::storage::LocalFileStorage;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: Arc<LocalFileStorage>,
        index: JsonIndex,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(LocalFileStorage::new(
            root.join("images"),
            "/files".to_string(),
            Duration::from_secs(5),
        ));
        let index = JsonIndex::new(root.join("images.json"), store.clone());
        Fixture {
            _dir: dir,
            root,
            store,
            index,
        }
    }

    async fn stored(fx: &Fixture, name: &str, bytes: &[u8]) -> ImageRecord {
        let id = Uuid::now_v7();
        let file_name = format!("{id}.png");
        let stored = fx.store.put(&file_name, bytes, name).await.unwrap();
        ImageRecord {
            id,
            name: name.to_string(),
            file_name,
            url: stored.url,
            size: stored.size,
            mime_type: "image/png".to_string(),
            upload_time: Utc::now(),
            github_url: None,
        }
    }

    fn read_document(root: &Path) -> Vec<ImageRecord> {
        serde_json::from_slice(&std::fs::read(root.join("images.json")).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn missing_document_is_empty() {
        let fx = fixture();
        assert!(fx.index.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_document_is_moved_aside() {
        let fx = fixture();
        std::fs::write(fx.root.join("images.json"), b"{ not json").unwrap();

        assert!(fx.index.list().await.unwrap().is_empty());
        assert!(!fx.root.join("images.json").exists());

        let record = stored(&fx, "cat.png", b"x").await;
        fx.index.insert(record.clone()).await.unwrap();

        assert_eq!(
            std::fs::read(fx.root.join("images.json.corrupt")).unwrap(),
            b"{ not json"
        );
        assert_eq!(fx.index.list().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let fx = fixture();
        let mut inserted = Vec::new();
        for name in ["a.png", "b.png", "c.png", "d.png"] {
            let record = stored(&fx, name, b"x").await;
            fx.index.insert(record.clone()).await.unwrap();
            inserted.push(record);
        }
        inserted.reverse();
        assert_eq!(fx.index.list().await.unwrap(), inserted);
    }

    #[tokio::test]
    async fn insert_then_get_returns_equal_record() {
        let fx = fixture();
        let record = stored(&fx, "cat.png", &[7u8; 500]).await;
        fx.index.insert(record.clone()).await.unwrap();

        assert_eq!(fx.index.get(record.id).await.unwrap(), Some(record.clone()));
        assert_eq!(read_document(&fx.root), vec![record]);
    }

    #[tokio::test]
    async fn removing_unknown_id_changes_nothing() {
        let fx = fixture();
        let record = stored(&fx, "cat.png", b"x").await;
        fx.index.insert(record.clone()).await.unwrap();
        let before = std::fs::read(fx.root.join("images.json")).unwrap();

        assert!(fx.index.remove(Uuid::now_v7()).await.unwrap().is_none());

        assert_eq!(std::fs::read(fx.root.join("images.json")).unwrap(), before);
        assert_eq!(fx.index.list().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn removing_present_id_drops_exactly_one_record_and_blob() {
        let fx = fixture();
        let cat = stored(&fx, "cat.png", b"cat").await;
        let dog = stored(&fx, "dog.png", b"dog").await;
        fx.index.insert(cat.clone()).await.unwrap();
        fx.index.insert(dog.clone()).await.unwrap();

        let removal = fx.index.remove(cat.id).await.unwrap().expect("present");

        assert_eq!(removal.record, cat);
        assert!(matches!(removal.blob, BlobCleanup::Deleted));
        assert!(!fx.store.exists(&cat.file_name).await.unwrap());
        assert_eq!(fx.index.get(cat.id).await.unwrap(), None);
        assert_eq!(fx.index.list().await.unwrap(), vec![dog]);
    }

    #[tokio::test]
    async fn removing_record_with_missing_blob_still_succeeds() {
        let fx = fixture();
        let cat = stored(&fx, "cat.png", b"cat").await;
        fx.index.insert(cat.clone()).await.unwrap();
        fx.store.delete(&cat.file_name).await.unwrap();

        let removal = fx.index.remove(cat.id).await.unwrap().expect("present");

        assert!(matches!(removal.blob, BlobCleanup::AlreadyMissing));
        assert!(read_document(&fx.root).is_empty());
    }

    #[tokio::test]
    async fn failed_blob_delete_still_removes_the_record() {
        let fx = fixture();
        let cat = stored(&fx, "cat.png", b"cat").await;
        fx.index.insert(cat.clone()).await.unwrap();
        let blob = fx.root.join("images").join(&cat.file_name);
        std::fs::remove_file(&blob).unwrap();
        std::fs::create_dir(&blob).unwrap();
        std::fs::write(blob.join("inner"), b"x").unwrap();

        let removal = fx.index.remove(cat.id).await.unwrap().expect("present");

        assert_eq!(removal.record, cat);
        assert!(matches!(removal.blob, BlobCleanup::Failed(StoreError::Io(_))));
        assert!(read_document(&fx.root).is_empty());
        assert_eq!(fx.index.get(cat.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn prunes_orphans_once_and_persists() {
        let fx = fixture();
        let cat = stored(&fx, "cat.png", b"cat").await;
        let dog = stored(&fx, "dog.png", b"dog").await;
        fx.index.insert(cat.clone()).await.unwrap();
        fx.index.insert(dog.clone()).await.unwrap();

        std::fs::remove_file(fx.root.join("images").join(&cat.file_name)).unwrap();

        let first = fx.index.list().await.unwrap();
        assert_eq!(first, vec![dog.clone()]);
        assert_eq!(read_document(&fx.root), vec![dog]);
        let second = fx.index.list().await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn reads_legacy_documents() {
        let fx = fixture();
        fx.store.put("legacy.jpg", b"old", "old.jpg").await.unwrap();
        let legacy = r#"[{
            "id": "0b7d3e2c-8f7a-4e57-9a3d-2f1f1e9c8a11",
            "name": "old.jpg",
            "fileName": "legacy.jpg",
            "url": "/images/legacy.jpg",
            "size": 3,
            "type": "image/jpeg",
            "uploadTime": "2024-03-01T10:15:30.123Z"
        }]"#;
        std::fs::write(fx.root.join("images.json"), legacy).unwrap();

        let records = fx.index.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "old.jpg");
        assert_eq!(records[0].upload_time.timestamp_millis() % 1000, 123);
    }

    #[tokio::test]
    async fn concurrent_inserts_are_not_lost() {
        let fx = Arc::new(fixture());
        let mut handles = Vec::new();
        for i in 0..16 {
            let fx = fx.clone();
            handles.push(tokio::spawn(async move {
                let record = stored(&fx, &format!("{i}.png"), b"x").await;
                fx.index.insert(record).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(fx.index.list().await.unwrap().len(), 16);
    }
}
