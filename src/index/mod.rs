//! The image metadata index: records describing stored images, kept
//! consistent with the blob store that holds their bytes.

pub mod json;
pub mod listing;

pub use json::JsonIndex;
pub use listing::ListingIndex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: Uuid,
    pub name: String,
    pub file_name: String,
    pub url: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub upload_time: DateTime<Utc>,
    /// Page for the file on GitHub; only the GitHub backend sets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
}

/// What happened to the blob behind a removed record.
#[derive(Debug)]
pub enum BlobCleanup {
    Deleted,
    AlreadyMissing,
    /// The record is gone but its blob may be orphaned.
    Failed(StoreError),
}

#[derive(Debug)]
pub struct Removal {
    pub record: ImageRecord,
    pub blob: BlobCleanup,
}

#[async_trait::async_trait]
pub trait ImageIndex: Send + Sync {
    /// All records, newest first.
    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.list().await?.into_iter().find(|record| record.id == id))
    }

    /// Adds a record whose blob has already been written, returning it as
    /// later reads will report it.
    async fn insert(&self, record: ImageRecord) -> Result<ImageRecord, StoreError>;

    /// Removes a record and its blob. `None` when no record has this id.
    async fn remove(&self, id: Uuid) -> Result<Option<Removal>, StoreError>;
}

/// Upload time embedded in a time-ordered (v7) identifier.
pub fn upload_time_of(id: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}

/// Maps a backend-native file name to an identifier and upload time.
///
/// `{uuid}.{ext}` keeps its UUID; legacy `{epoch_millis}.{ext}` and any other
/// name get a name-derived v5 UUID. Names without a recoverable time sort last.
pub fn identify_file_name(file_name: &str) -> (Uuid, DateTime<Utc>) {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    if let Ok(id) = Uuid::parse_str(stem) {
        let time = upload_time_of(&id).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        return (id, time);
    }
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, file_name.as_bytes());
    let time = if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
        stem.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    } else {
        DateTime::<Utc>::UNIX_EPOCH
    };
    (id, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v7_ids_carry_their_upload_time() {
        let before = Utc::now().timestamp_millis();
        let id = Uuid::now_v7();
        let after = Utc::now().timestamp_millis();
        let time = upload_time_of(&id).unwrap().timestamp_millis();
        assert!(before <= time && time <= after);
    }

    #[test]
    fn v4_ids_have_no_upload_time() {
        assert_eq!(upload_time_of(&Uuid::new_v4()), None);
    }

    #[test]
    fn identifies_uuid_file_names() {
        let id = Uuid::now_v7();
        let (parsed, time) = identify_file_name(&format!("{id}.png"));
        assert_eq!(parsed, id);
        assert_eq!(Some(time), upload_time_of(&id));
    }

    #[test]
    fn identifies_legacy_timestamp_names_numerically() {
        let (a_id, short) = identify_file_name("999999999999.png");
        let (b_id, long) = identify_file_name("1700000000000.png");
        assert_ne!(a_id, b_id);
        assert!(long > short);
        assert_eq!(long.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(identify_file_name("1700000000000.png").0, b_id);
    }

    #[test]
    fn other_names_sort_last() {
        let (_, time) = identify_file_name("holiday photo.jpg");
        assert_eq!(time, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn record_uses_camel_case_wire_names() {
        let record = ImageRecord {
            id: Uuid::nil(),
            name: "cat.png".into(),
            file_name: "x.png".into(),
            url: "/files/x.png".into(),
            size: 3,
            mime_type: "image/png".into(),
            upload_time: DateTime::<Utc>::UNIX_EPOCH,
            github_url: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["fileName"], "x.png");
        assert!(value.get("githubUrl").is_none());
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["uploadTime"], "1970-01-01T00:00:00Z");
    }
}
