use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AwarenessState, TransferReason};

/// Every asset-protocol message that travels on the shared duplex channel.
///
/// Wire shape is `{"type": "<kebab-case tag>", "data": {...}}`, multiplexed
/// with opaque CRDT sync frames by a one-byte marker (see `net::channel`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum AssetMessage {
    /// Announce presence and/or the set of asset ids this peer can serve.
    /// Only blob-backed assets may appear in `available_assets`.
    AwarenessUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<AwarenessState>,
        #[serde(rename = "availableAssets", default, skip_serializing_if = "Option::is_none")]
        available_assets: Option<Vec<Uuid>>,
        /// Set on the clear-on-unload path so peers drop this user promptly.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        leaving: bool,
    },
    /// Ask the coordinator to locate a holder for an asset.
    RequestAsset {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        priority: u8,
        reason: TransferReason,
    },
    /// Coordinator asks this peer, which claims to hold the asset, to upload it.
    UploadRequest {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        #[serde(rename = "uploadUrl")]
        upload_url: String,
    },
    /// Reply to an upload request: did the upload succeed, and how big was it.
    AssetUploaded {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Upload a whole batch, strictly sequentially.
    BulkUploadRequest {
        #[serde(rename = "batchId")]
        batch_id: String,
        assets: Vec<BulkUploadItem>,
    },
    /// Progress report emitted every few completions and on the final one.
    BulkUploadProgress {
        #[serde(rename = "batchId")]
        batch_id: String,
        completed: usize,
        failed: usize,
        total: usize,
    },
    /// A peer finished uploading its batch; those assets are now fetchable.
    BulkUploadComplete {
        #[serde(rename = "assetIds", default)]
        asset_ids: Vec<Uuid>,
    },
    /// An asset is available for download at the given location.
    AssetReady {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        #[serde(rename = "downloadUrl")]
        download_url: String,
    },
    /// No holder could be located anywhere.
    AssetNotFound {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
    },
    /// Hint to warm the local cache with a set of assets, optionally deferred.
    PrefetchAssets {
        #[serde(rename = "assetIds")]
        asset_ids: Vec<Uuid>,
        #[serde(rename = "delayMs", default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    /// An asset's transfer priority changed.
    PriorityUpdate {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        priority: u8,
        reason: TransferReason,
    },
    /// Bulk priority boost for everything on a freshly opened page.
    NavigationHint {
        #[serde(rename = "pageId")]
        page_id: String,
        #[serde(rename = "assetIds")]
        asset_ids: Vec<Uuid>,
    },
    /// Informational: where a request sits in the coordinator's queue.
    PriorityAck {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        #[serde(rename = "queuePosition", default, skip_serializing_if = "Option::is_none")]
        queue_position: Option<usize>,
        #[serde(rename = "estimatedWaitMs", default, skip_serializing_if = "Option::is_none")]
        estimated_wait_ms: Option<u64>,
    },
    /// Abort the named in-flight upload; it will be re-queued at low priority.
    PreemptUpload {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
    },
    /// A previously preempted upload may adjust its queue priority.
    ResumeUpload {
        #[serde(rename = "assetId")]
        asset_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
    },
    /// A transfer slot freed up; listeners may pull the next queued item.
    SlotAvailable {},
    /// Fatal: this client no longer has access to the project.
    AccessRevoked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkUploadItem {
    pub asset_id: Uuid,
    pub upload_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags_are_kebab_case() {
        let msg = AssetMessage::RequestAsset {
            asset_id: Uuid::new_v4(),
            priority: 90,
            reason: TransferReason::Render,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request-asset");
        assert_eq!(json["data"]["reason"], "render");

        let msg = AssetMessage::SlotAvailable {};
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "slot-available");
    }

    #[test]
    fn round_trips_through_json() {
        let msg = AssetMessage::AssetUploaded {
            asset_id: Uuid::new_v4(),
            success: false,
            size: None,
            error: Some("HTTP 500".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AssetMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let res: Result<AssetMessage, _> =
            serde_json::from_str(r#"{"type":"mystery-message","data":{}}"#);
        assert!(res.is_err());
    }
}
