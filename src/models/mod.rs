mod asset;
mod awareness;
mod error;
mod messages;

pub use asset::{
    AssetRecord, BulkUploadFailure, BulkUploadReport, StoreAssetMeta, TransferReason,
    PRIORITY_NAVIGATION, PRIORITY_PREEMPTED_LOW, PRIORITY_PREFETCH, PRIORITY_RENDER, PRIORITY_SAVE,
};
pub use awareness::{AwarenessState, DirtyState, LockInfo};
pub use error::SyncError;
pub use messages::{AssetMessage, BulkUploadItem};
