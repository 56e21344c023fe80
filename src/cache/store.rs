use std::path::Path;

use loro::LoroDoc;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{AssetRecord, SyncError};

/// CRDT update log, append-only, keyed by sequence number.
const DOC_UPDATES: TableDefinition<u64, &[u8]> = TableDefinition::new("doc_updates");
/// Asset blobs keyed by asset id. Append-only by id: a stored blob is never rewritten.
const ASSET_BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("asset_blobs");
/// Asset metadata records, JSON-encoded, keyed by asset id.
const ASSET_META: TableDefinition<&str, &str> = TableDefinition::new("asset_meta");

/// Embedded durable cache for one document: the CRDT update log plus the
/// local asset blob/metadata store.
///
/// This is the single source of truth for "do I have this locally" — both
/// for document state and for asset blobs.
pub struct DurableCache {
    db: Database,
    doc_key: String,
}

impl DurableCache {
    /// Open (or create) the cache file for a document identified by a stable key.
    ///
    /// All tables are created up front so later reads never race table creation.
    pub fn open(dir: &Path, doc_key: &str) -> Result<Self, SyncError> {
        std::fs::create_dir_all(dir).map_err(|e| SyncError::Cache(e.to_string()))?;
        let path = dir.join(format!("{}.redb", doc_key));
        let db = Database::create(&path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(DOC_UPDATES)?;
            txn.open_table(ASSET_BLOBS)?;
            txn.open_table(ASSET_META)?;
        }
        txn.commit()?;

        debug!("Opened durable cache for document '{}' at {:?}", doc_key, path);
        Ok(Self {
            db,
            doc_key: doc_key.to_string(),
        })
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    /// Append one CRDT update to the document log.
    pub fn append_update(&self, update: &[u8]) -> Result<(), SyncError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOC_UPDATES)?;
            let next_seq = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(0);
            table.insert(next_seq, update)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Replay the whole update log into a document replica, in sequence order.
    ///
    /// Returns the number of updates applied; a successful return is the
    /// "fully replayed" signal the session init protocol waits on.
    pub fn replay_into(&self, doc: &LoroDoc) -> Result<usize, SyncError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOC_UPDATES)?;
        let mut applied = 0usize;
        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Err(e) = doc.import(value.value()) {
                // One bad log entry must not take the whole document down.
                warn!("Skipping unreadable cached update for '{}': {}", self.doc_key, e);
                continue;
            }
            applied += 1;
        }
        if applied > 0 {
            info!("Replayed {} cached updates for document '{}'", applied, self.doc_key);
        }
        Ok(applied)
    }

    /// Replace the update log with a single snapshot entry.
    pub fn compact(&self, snapshot: &[u8]) -> Result<(), SyncError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(DOC_UPDATES)?;
        {
            let mut table = txn.open_table(DOC_UPDATES)?;
            table.insert(0u64, snapshot)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Store an asset blob. Append-only by id: if a blob for this id already
    /// exists the call is a no-op and returns false.
    pub fn put_blob(&self, id: Uuid, blob: &[u8]) -> Result<bool, SyncError> {
        let key = id.to_string();
        let txn = self.db.begin_write()?;
        let stored = {
            let mut table = txn.open_table(ASSET_BLOBS)?;
            if table.get(key.as_str())?.is_some() {
                false
            } else {
                table.insert(key.as_str(), blob)?;
                true
            }
        };
        txn.commit()?;
        Ok(stored)
    }

    pub fn get_blob(&self, id: Uuid) -> Result<Option<Vec<u8>>, SyncError> {
        let key = id.to_string();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ASSET_BLOBS)?;
        Ok(table.get(key.as_str())?.map(|g| g.value().to_vec()))
    }

    pub fn has_blob(&self, id: Uuid) -> Result<bool, SyncError> {
        let key = id.to_string();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ASSET_BLOBS)?;
        Ok(table.get(key.as_str())?.is_some())
    }

    /// All asset ids for which a blob is present locally. This is the only
    /// valid source for an availability announcement.
    pub fn blob_ids(&self) -> Result<Vec<Uuid>, SyncError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ASSET_BLOBS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            match Uuid::parse_str(key.value()) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Ignoring malformed blob key '{}': {}", key.value(), e),
            }
        }
        Ok(ids)
    }

    pub fn put_meta(&self, record: &AssetRecord) -> Result<(), SyncError> {
        let key = record.id.to_string();
        let json = serde_json::to_string(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ASSET_META)?;
            table.insert(key.as_str(), json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_meta(&self, id: Uuid) -> Result<Option<AssetRecord>, SyncError> {
        let key = id.to_string();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ASSET_META)?;
        match table.get(key.as_str())? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Flip the local-blob flag on an existing metadata record after its
    /// blob landed in the cache.
    pub fn set_blob_present(&self, id: Uuid) -> Result<(), SyncError> {
        if let Some(mut record) = self.get_meta(id)? {
            if !record.has_local_blob {
                record.has_local_blob = true;
                self.put_meta(&record)?;
            }
        }
        Ok(())
    }

    /// Merge store-side metadata into the local record without ever clearing
    /// the local blob flag.
    pub fn merge_meta(&self, incoming: &AssetRecord) -> Result<(), SyncError> {
        let merged = match self.get_meta(incoming.id)? {
            Some(mut existing) => {
                existing.merge_store_meta(incoming);
                existing
            }
            None => incoming.clone(),
        };
        self.put_meta(&merged)
    }

    pub fn list_meta(&self) -> Result<Vec<AssetRecord>, SyncError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ASSET_META)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            match serde_json::from_str(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Dropping unreadable asset metadata entry: {}", e),
            }
        }
        Ok(records)
    }
}
