use std::sync::Arc;

use uuid::Uuid;

use crate::error::StoreError;
use crate::index::{BlobCleanup, ImageIndex, ImageRecord, Removal, identify_file_name};
use crate::media::{extension_from_filename, get_mime_type_from_extension, is_listable_image};
use crate::storage::{BlobEntry, BlobRemoval, BlobStore};

/// Index recomputed from the blob store's directory listing on every read.
/// The listing is the source of truth, so there is nothing to persist or prune.
pub struct ListingIndex {
    store: Arc<dyn BlobStore>,
}

impl ListingIndex {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

fn record_from_entry(entry: BlobEntry) -> ImageRecord {
    let (id, upload_time) = identify_file_name(&entry.key);
    let mime_type = extension_from_filename(&entry.key)
        .and_then(|ext| get_mime_type_from_extension(&ext))
        .unwrap_or("application/octet-stream")
        .to_string();
    ImageRecord {
        id,
        name: entry.key.clone(),
        file_name: entry.key,
        url: entry.url,
        size: entry.size,
        mime_type,
        upload_time,
        github_url: entry.page_url,
    }
}

#[async_trait::async_trait]
impl ImageIndex for ListingIndex {
    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let mut records: Vec<ImageRecord> = self
            .store
            .listing()
            .await?
            .into_iter()
            .filter(|entry| is_listable_image(&entry.key))
            .map(record_from_entry)
            .collect();
        records.sort_by(|a, b| {
            b.upload_time
                .cmp(&a.upload_time)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(records)
    }

    /// Nothing to persist. The uploader's name has nowhere to live, so the
    /// record comes back in the form the listing will report.
    async fn insert(&self, record: ImageRecord) -> Result<ImageRecord, StoreError> {
        Ok(record_from_entry(BlobEntry {
            key: record.file_name,
            size: record.size,
            url: record.url,
            page_url: record.github_url,
        }))
    }

    async fn remove(&self, id: Uuid) -> Result<Option<Removal>, StoreError> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        let blob = match self.store.delete(&record.file_name).await? {
            BlobRemoval::Deleted => BlobCleanup::Deleted,
            BlobRemoval::AlreadyMissing => BlobCleanup::AlreadyMissing,
        };
        Ok(Some(Removal { record, blob }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::index::upload_time_of;
    use crate::storage::LocalFileStorage;

    fn setup() -> (tempfile::TempDir, Arc<LocalFileStorage>, ListingIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileStorage::new(
            dir.path().join("images"),
            "https://cdn.example.com/files".to_string(),
            Duration::from_secs(5),
        ));
        let index = ListingIndex::new(store.clone());
        (dir, store, index)
    }

    #[tokio::test]
    async fn filters_to_visible_images() {
        let (_dir, store, index) = setup();
        store.put("1700000000000.PNG", b"a", "a").await.unwrap();
        store.put(".hidden.png", b"b", "b").await.unwrap();
        store.put("notes.txt", b"c", "c").await.unwrap();

        let records = index.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "1700000000000.PNG");
        assert_eq!(records[0].mime_type, "image/png");
        assert_eq!(records[0].url, "https://cdn.example.com/files/1700000000000.PNG");
    }

    #[tokio::test]
    async fn sorts_by_typed_upload_time() {
        let (_dir, store, index) = setup();
        let fresh = Uuid::now_v7();
        store.put(&format!("{fresh}.webp"), b"new", "new").await.unwrap();
        store.put("999999999999.jpg", b"short", "short").await.unwrap();
        store.put("1700000000000.gif", b"long", "long").await.unwrap();
        store.put("scan.bmp", b"unknown", "unknown").await.unwrap();

        let names: Vec<String> = index
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.file_name)
            .collect();
        assert_eq!(
            names,
            vec![
                format!("{fresh}.webp"),
                "1700000000000.gif".to_string(),
                "999999999999.jpg".to_string(),
                "scan.bmp".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn uuid_names_round_trip_their_identity() {
        let (_dir, store, index) = setup();
        let id = Uuid::now_v7();
        let file_name = format!("{id}.png");
        store.put(&file_name, &[1u8; 42], "cat.png").await.unwrap();

        let record = index.get(id).await.unwrap().expect("listed");
        assert_eq!(record.size, 42);
        assert_eq!(Some(record.upload_time), upload_time_of(&id));
    }

    #[tokio::test]
    async fn inserted_record_matches_later_reads() {
        let (_dir, store, index) = setup();
        let id = Uuid::now_v7();
        let file_name = format!("{id}.png");
        let stored = store.put(&file_name, &[9u8; 12], "cat.png").await.unwrap();

        let inserted = index
            .insert(ImageRecord {
                id,
                name: "cat.png".to_string(),
                file_name: file_name.clone(),
                url: stored.url,
                size: stored.size,
                mime_type: "image/png".to_string(),
                upload_time: upload_time_of(&id).unwrap(),
                github_url: None,
            })
            .await
            .unwrap();

        assert_eq!(inserted.name, file_name);
        assert_eq!(index.get(id).await.unwrap(), Some(inserted));
    }

    #[tokio::test]
    async fn remove_deletes_the_blob() {
        let (_dir, store, index) = setup();
        let id = Uuid::now_v7();
        let file_name = format!("{id}.png");
        store.put(&file_name, b"x", "x").await.unwrap();

        assert!(index.remove(Uuid::now_v7()).await.unwrap().is_none());
        let removal = index.remove(id).await.unwrap().expect("present");
        assert!(matches!(removal.blob, BlobCleanup::Deleted));
        assert!(!store.exists(&file_name).await.unwrap());
        assert!(index.list().await.unwrap().is_empty());
    }
}
