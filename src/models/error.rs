use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the sync subsystem.
///
/// Connectivity and timing failures are generally swallowed at the call site
/// and degrade to offline behaviour; save failures are the one category that
/// is always re-thrown to the caller.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("asset '{0}' not found")]
    AssetNotFound(Uuid),

    #[error("transfer failed with status {status}: {body}")]
    Transfer { status: u16, body: String },

    #[error("a save is already in progress")]
    SaveInFlight,

    #[error("local cache error: {0}")]
    Cache(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("document error: {0}")]
    Crdt(#[from] loro::LoroError),

    #[error("document encode error: {0}")]
    CrdtEncode(#[from] loro::LoroEncodeError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("access to this project has been revoked")]
    AccessRevoked,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<redb::DatabaseError> for SyncError {
    fn from(e: redb::DatabaseError) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<redb::TransactionError> for SyncError {
    fn from(e: redb::TransactionError) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<redb::TableError> for SyncError {
    fn from(e: redb::TableError) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<redb::StorageError> for SyncError {
    fn from(e: redb::StorageError) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<redb::CommitError> for SyncError {
    fn from(e: redb::CommitError) -> Self {
        SyncError::Cache(e.to_string())
    }
}
