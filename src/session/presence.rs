use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use loro::{LoroDoc, LoroMap, ToJson};
use tracing::debug;

use crate::models::{AwarenessState, LockInfo, SyncError};

/// In-memory registry of who is online and where they are looking.
/// Ephemeral by design: nothing here ever touches the durable cache.
pub struct AwarenessRegistry {
    local: AwarenessState,
    peers: HashMap<String, AwarenessState>,
}

impl AwarenessRegistry {
    pub fn new(local: AwarenessState) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn set_selected_page(&mut self, page_id: Option<String>) -> AwarenessState {
        self.local.selected_page_id = page_id;
        self.local.clone()
    }

    pub fn set_editing_component(&mut self, component_id: Option<String>) -> AwarenessState {
        self.local.editing_component_id = component_id;
        self.local.clone()
    }

    /// Apply a presence update received from a peer. The local user's own
    /// echoes are ignored.
    pub fn apply_peer(&mut self, state: AwarenessState) {
        if state.user_id == self.local.user_id {
            return;
        }
        self.peers.insert(state.user_id.clone(), state);
    }

    pub fn remove_peer(&mut self, user_id: &str) {
        if self.peers.remove(user_id).is_some() {
            debug!("Peer '{}' left", user_id);
        }
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    /// Every connected user, local first.
    pub fn online_users(&self) -> Vec<AwarenessState> {
        let mut users = vec![self.local.clone()];
        users.extend(self.peers.values().cloned());
        users
    }

    pub fn users_on_page(&self, page_id: &str) -> Vec<AwarenessState> {
        self.online_users()
            .into_iter()
            .filter(|u| u.selected_page_id.as_deref() == Some(page_id))
            .collect()
    }

    pub fn users_editing_component(&self, component_id: &str) -> Vec<AwarenessState> {
        self.online_users()
            .into_iter()
            .filter(|u| u.editing_component_id.as_deref() == Some(component_id))
            .collect()
    }
}

/// Component-level lock coordination, keyed by the same document the session
/// edits. The session only talks to this interface.
pub trait LockCoordinator: Send + Sync {
    /// Try to take the lock. Returns false if another holder has it.
    /// Re-locking a component you already hold refreshes the timestamp.
    fn request_lock(&self, component_id: &str, holder_id: &str) -> Result<bool, SyncError>;

    /// Release the lock if held by this holder. Returns whether a lock was released.
    fn release_lock(&self, component_id: &str, holder_id: &str) -> Result<bool, SyncError>;

    fn lock_info(&self, component_id: &str) -> Result<Option<LockInfo>, SyncError>;
}

/// Default coordinator: the lock map lives in the replicated document itself
/// (`locks` map container, componentId -> {holderId, timestamp}), so lock
/// state converges across peers like any other document state. Lock
/// bookkeeping commits with a system origin and never dirties the document.
pub struct DocLockCoordinator {
    doc: Arc<LoroDoc>,
}

impl DocLockCoordinator {
    pub fn new(doc: Arc<LoroDoc>) -> Self {
        Self { doc }
    }

    fn read_lock(&self, component_id: &str) -> Result<Option<LockInfo>, SyncError> {
        let value = self.doc.get_deep_value().to_json_value();
        match value.get("locks").and_then(|locks| locks.get(component_id)) {
            Some(entry) => Ok(serde_json::from_value(entry.clone()).ok()),
            None => Ok(None),
        }
    }
}

impl LockCoordinator for DocLockCoordinator {
    fn request_lock(&self, component_id: &str, holder_id: &str) -> Result<bool, SyncError> {
        if let Some(existing) = self.read_lock(component_id)? {
            if existing.holder_id != holder_id {
                return Ok(false);
            }
        }
        let locks = self.doc.get_map("locks");
        let entry = locks.get_or_create_container(component_id, LoroMap::new())?;
        entry.insert("holderId", holder_id)?;
        entry.insert("timestamp", Utc::now().to_rfc3339().as_str())?;
        self.doc
            .commit_with(loro::CommitOptions::new().origin("sys:lock"));
        Ok(true)
    }

    fn release_lock(&self, component_id: &str, holder_id: &str) -> Result<bool, SyncError> {
        match self.read_lock(component_id)? {
            Some(existing) if existing.holder_id == holder_id => {
                let locks = self.doc.get_map("locks");
                locks.delete(component_id)?;
                self.doc
                    .commit_with(loro::CommitOptions::new().origin("sys:lock"));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lock_info(&self, component_id: &str) -> Result<Option<LockInfo>, SyncError> {
        self.read_lock(component_id)
    }
}
