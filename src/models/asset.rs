use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority tier for an asset needed by the rendering surface right now.
pub const PRIORITY_RENDER: u8 = 90;
/// Priority tier for assets on a page the user just navigated to.
pub const PRIORITY_NAVIGATION: u8 = 70;
/// Priority tier for assets needed by an explicit save.
pub const PRIORITY_SAVE: u8 = 60;
/// Priority tier for speculative background prefetch.
pub const PRIORITY_PREFETCH: u8 = 30;
/// Tier a preempted upload is re-queued at so it still makes forward progress.
pub const PRIORITY_PREEMPTED_LOW: u8 = 10;

/// Why a transfer was requested. Travels on the wire in priority updates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferReason {
    Render,
    Navigation,
    Prefetch,
    Save,
    Preempted,
}

/// Everything we know about one binary attachment.
///
/// A record may be metadata-only (`has_local_blob == false`): the asset is
/// known to exist but its bytes were never fetched. Metadata-only records
/// must never be advertised to peers as a source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: Uuid,
    pub mime: String,
    pub filename: String,
    #[serde(default)]
    pub folder_path: String,
    pub size: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub has_local_blob: bool,
    #[serde(default)]
    pub uploaded_to_store: bool,
}

impl AssetRecord {
    /// Merge freshly fetched store metadata into this record without ever
    /// downgrading local blob knowledge.
    pub fn merge_store_meta(&mut self, other: &AssetRecord) {
        self.mime = other.mime.clone();
        self.filename = other.filename.clone();
        self.folder_path = other.folder_path.clone();
        self.size = other.size;
        if other.hash.is_some() {
            self.hash = other.hash.clone();
        }
        self.uploaded_to_store = self.uploaded_to_store || other.uploaded_to_store;
        // has_local_blob is owned by the local cache, never by remote metadata.
    }
}

/// Asset metadata as listed by the authoritative store.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoreAssetMeta {
    pub client_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub folder_path: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&StoreAssetMeta> for AssetRecord {
    fn from(meta: &StoreAssetMeta) -> Self {
        AssetRecord {
            id: meta.client_id,
            mime: meta.mime_type.clone(),
            filename: meta.filename.clone(),
            folder_path: meta.folder_path.clone(),
            size: meta.size,
            hash: None,
            has_local_blob: false,
            uploaded_to_store: true,
        }
    }
}

/// Outcome of one bulk upload batch. Partial failure is the normal case,
/// not an error path.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct BulkUploadReport {
    pub completed: usize,
    pub failed: usize,
    pub failures: Vec<BulkUploadFailure>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BulkUploadFailure {
    pub asset_id: Uuid,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_store_meta_keeps_local_blob_flag() {
        let id = Uuid::new_v4();
        let mut local = AssetRecord {
            id,
            mime: "image/png".to_string(),
            filename: "old.png".to_string(),
            folder_path: "".to_string(),
            size: 10,
            hash: Some("abc".to_string()),
            has_local_blob: true,
            uploaded_to_store: false,
        };
        let remote = AssetRecord {
            id,
            mime: "image/png".to_string(),
            filename: "renamed.png".to_string(),
            folder_path: "media".to_string(),
            size: 10,
            hash: None,
            has_local_blob: false,
            uploaded_to_store: true,
        };
        local.merge_store_meta(&remote);
        assert!(local.has_local_blob);
        assert!(local.uploaded_to_store);
        assert_eq!(local.filename, "renamed.png");
        assert_eq!(local.hash.as_deref(), Some("abc"));
    }
}
