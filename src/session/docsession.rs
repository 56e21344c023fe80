use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use loro::{ExportMode, LoroDoc, LoroList, LoroMap};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::StoreClient;
use crate::config::Config;
use crate::models::{AssetMessage, AwarenessState, DirtyState, LockInfo, SyncError};
use crate::net::ChannelHandle;
use crate::cache::DurableCache;
use crate::session::presence::{AwarenessRegistry, DocLockCoordinator, LockCoordinator};

/// Who caused a document transaction. Every mutation path tags one of these;
/// the dirty-tracking observer only reacts to non-system origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOrigin {
    /// Bootstrap and infrastructure writes (default structure, lock map).
    System,
    /// A local user edit.
    Local,
    /// An update applied from a peer or the authoritative store.
    Remote,
}

type DirtyListener = Box<dyn Fn() + Send + Sync>;

/// One collaborative document session: the replica, its durable cache
/// binding, the duplex channel, presence, undo and dirty/save tracking.
pub struct DocSession {
    project_id: String,
    doc: Arc<LoroDoc>,
    cache: Arc<DurableCache>,
    channel: ChannelHandle,
    store: Arc<StoreClient>,
    awareness: Arc<Mutex<AwarenessRegistry>>,
    locks: Arc<dyn LockCoordinator>,
    undo: Mutex<loro::UndoManager>,
    dirty: Arc<Mutex<DirtyState>>,
    dirty_listeners: Arc<Mutex<Vec<DirtyListener>>>,
    converged: Arc<Notify>,
    // Held for its side effect: local commits stream to the channel and the log.
    _local_update_sub: loro::Subscription,
}

impl DocSession {
    /// Bring a document session up, in order, with race guards.
    ///
    /// 1. Replay the durable cache log into a fresh replica.
    /// 2/3. New documents never wait on the network; existing documents wait
    ///    a bounded time for peer convergence and proceed regardless.
    /// 4. A still-empty tree triggers one last-resort authoritative-store pull.
    /// 5. A still-empty tree is bootstrapped with a default page inside a
    ///    single transaction, re-checking emptiness inside it.
    /// 6-7. Undo tracking (local origins only) and the dirty observer.
    pub async fn initialize(
        config: &Config,
        project_id: &str,
        user: AwarenessState,
        is_new_doc: bool,
        channel: ChannelHandle,
        mut crdt_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<Arc<Self>, SyncError> {
        // Step 1: local durable state first. Nothing below may outrun this.
        let cache = Arc::new(DurableCache::open(
            Path::new(&config.cache_dir),
            project_id,
        )?);
        let doc = Arc::new(LoroDoc::new());
        let replayed = cache.replay_into(&doc)?;

        let dirty = Arc::new(Mutex::new(DirtyState::default()));
        let dirty_listeners: Arc<Mutex<Vec<DirtyListener>>> = Arc::new(Mutex::new(Vec::new()));
        let converged = Arc::new(Notify::new());

        // Local commits stream out to peers and into the durable log.
        let local_update_sub = {
            let channel = channel.clone();
            let cache = cache.clone();
            doc.subscribe_local_update(Box::new(move |update: &Vec<u8>| {
                if let Err(e) = channel.send_crdt(update.clone()) {
                    debug!("Local update not broadcast (offline): {}", e);
                }
                if let Err(e) = cache.append_update(update) {
                    warn!("Failed to persist local update: {}", e);
                }
                true
            }))
        };

        // Remote updates: apply, persist, mark dirty, signal convergence.
        {
            let doc = doc.clone();
            let cache = cache.clone();
            let dirty = dirty.clone();
            let dirty_listeners = dirty_listeners.clone();
            let converged = converged.clone();
            tokio::spawn(async move {
                while let Some(frame) = crdt_rx.recv().await {
                    if let Err(e) = doc.import(&frame) {
                        warn!("Dropping unreadable sync frame: {}", e);
                        continue;
                    }
                    if let Err(e) = cache.append_update(&frame) {
                        warn!("Failed to persist remote update: {}", e);
                    }
                    mark_dirty(&dirty, &dirty_listeners);
                    // notify_one stores a permit, so a late waiter still
                    // observes that convergence already happened.
                    converged.notify_one();
                }
            });
        }

        // Steps 2/3: bounded convergence wait for existing documents only.
        // An empty local log is no exemption: a fresh machine opening an
        // existing document must still wait for peers before concluding the
        // document is empty.
        if !is_new_doc && !config.offline {
            let wait = tokio::time::timeout(config.convergence_timeout(), converged.notified());
            if wait.await.is_err() {
                // Degrade silently to offline-with-local-state.
                info!(
                    "No peer convergence for '{}' within {:?}, continuing with {} replayed local updates",
                    project_id,
                    config.convergence_timeout(),
                    replayed
                );
            }
        }

        let store = Arc::new(StoreClient::new(
            config.store_base_url.clone(),
            config.bearer_token.clone(),
        ));

        // Step 4: last-resort authoritative pull for a still-empty tree.
        if doc.get_movable_list("pages").is_empty() && !config.offline {
            match store.fetch_document(project_id).await {
                Ok(state) if !state.is_empty() => {
                    if let Err(e) = doc.import(&state) {
                        warn!("Authoritative state for '{}' was unreadable: {}", project_id, e);
                    } else {
                        info!("Loaded '{}' from the authoritative store", project_id);
                        if let Err(e) = cache.append_update(&state) {
                            warn!("Failed to persist authoritative state: {}", e);
                        }
                    }
                }
                Ok(_) => debug!("Authoritative store has no state for '{}'", project_id),
                Err(e) => warn!("Authoritative load for '{}' failed: {}", project_id, e),
            }
        }

        // Step 5: bootstrap a default structure, re-checking emptiness inside
        // the transaction so a peer populating the doc in between never
        // results in two default pages.
        Self::bootstrap_default_structure(&doc)?;

        // Step 6: undo scoped to local-origin updates. Remote imports are
        // never recorded; system-origin commits are excluded explicitly.
        let mut undo = loro::UndoManager::new(&doc);
        undo.add_exclude_origin_prefix("sys:");

        let locks: Arc<dyn LockCoordinator> = Arc::new(DocLockCoordinator::new(doc.clone()));

        let session = Arc::new(Self {
            project_id: project_id.to_string(),
            doc,
            cache,
            channel,
            store,
            awareness: Arc::new(Mutex::new(AwarenessRegistry::new(user))),
            locks,
            undo: Mutex::new(undo),
            dirty,
            dirty_listeners,
            converged,
            _local_update_sub: local_update_sub,
        });

        // Announce ourselves so peers see presence immediately.
        session.broadcast_presence();
        Ok(session)
    }

    /// Synthesize the default single-page structure if, and only if, the
    /// navigation tree is empty. Commits with a system origin so bootstrap
    /// content never dirties the document.
    pub(crate) fn bootstrap_default_structure(doc: &LoroDoc) -> Result<bool, SyncError> {
        // Pre-check outside the transaction.
        if !doc.get_movable_list("pages").is_empty() {
            return Ok(false);
        }

        let pages = doc.get_movable_list("pages");
        // Re-check inside the transaction scope: a peer may have populated
        // the document since the pre-check.
        if !pages.is_empty() {
            return Ok(false);
        }
        let page = pages.insert_container(0, LoroMap::new())?;
        page.insert("id", Uuid::new_v4().to_string().as_str())?;
        page.insert("title", "Welcome")?;
        page.insert_container("blocks", LoroList::new())?;

        let meta = doc.get_map("meta");
        meta.insert("createdAt", Utc::now().to_rfc3339().as_str())?;
        doc.commit_with(loro::CommitOptions::new().origin("sys:bootstrap"));
        info!("Bootstrapped default document structure");
        Ok(true)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn doc(&self) -> &Arc<LoroDoc> {
        &self.doc
    }

    pub fn cache(&self) -> &Arc<DurableCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }

    pub fn awareness(&self) -> &Arc<Mutex<AwarenessRegistry>> {
        &self.awareness
    }

    /// Wait until at least one remote update has been applied.
    pub async fn converged(&self) {
        self.converged.notified().await;
    }

    // ----- local edit surface -------------------------------------------

    /// Append a page to the navigation tree. Returns the new page id.
    pub fn add_page(&self, title: &str) -> Result<String, SyncError> {
        let pages = self.doc.get_movable_list("pages");
        let page_id = Uuid::new_v4().to_string();
        let page = pages.insert_container(pages.len(), LoroMap::new())?;
        page.insert("id", page_id.as_str())?;
        page.insert("title", title)?;
        page.insert_container("blocks", LoroList::new())?;
        self.commit(TxnOrigin::Local);
        Ok(page_id)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.doc.get_map("meta").insert(key, value)?;
        self.commit(TxnOrigin::Local);
        Ok(())
    }

    /// Commit the open transaction with an explicit origin and run the
    /// dirty-tracking observer.
    pub fn commit(&self, origin: TxnOrigin) {
        match origin {
            TxnOrigin::System => self
                .doc
                .commit_with(loro::CommitOptions::new().origin("sys:internal")),
            TxnOrigin::Local => self.doc.commit(),
            TxnOrigin::Remote => self.doc.commit(),
        }
        if origin != TxnOrigin::System {
            mark_dirty(&self.dirty, &self.dirty_listeners);
        }
    }

    pub fn encode_snapshot(&self) -> Result<Vec<u8>, SyncError> {
        Ok(self.doc.export(ExportMode::Snapshot)?)
    }

    pub fn undo(&self) -> Result<bool, SyncError> {
        let mut undo = self.undo.lock().unwrap();
        Ok(undo.undo()?)
    }

    pub fn redo(&self) -> Result<bool, SyncError> {
        let mut undo = self.undo.lock().unwrap();
        Ok(undo.redo()?)
    }

    // ----- dirty/save tracking ------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty.lock().unwrap().is_dirty
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty.lock().unwrap().clone()
    }

    /// Register a listener fired exactly once per clean-to-dirty transition.
    pub fn on_dirty(&self, listener: DirtyListener) {
        self.dirty_listeners.lock().unwrap().push(listener);
    }

    pub(crate) fn mark_dirty(&self) {
        mark_dirty(&self.dirty, &self.dirty_listeners);
    }

    /// Reset dirty tracking and record the save timestamp.
    pub fn mark_clean(&self) {
        let mut state = self.dirty.lock().unwrap();
        state.is_dirty = false;
        state.last_saved_at = Some(Utc::now());
    }

    /// Encode the full document state and push it to the authoritative store.
    ///
    /// Single-flight: a second call while one is in progress fails without
    /// side effects. On success the dirty flag clears and the save timestamp
    /// is recorded; on failure the error re-throws and dirty stays set so the
    /// caller can retry.
    pub async fn save_to_server(&self) -> Result<(), SyncError> {
        {
            let mut state = self.dirty.lock().unwrap();
            if state.save_in_progress {
                return Err(SyncError::SaveInFlight);
            }
            state.save_in_progress = true;
        }

        let result = match self.encode_snapshot() {
            Ok(snapshot) => {
                let compacted = snapshot.clone();
                let saved = self.store.save_document(&self.project_id, snapshot).await;
                if saved.is_ok() {
                    // A confirmed save is a natural point to fold the log.
                    if let Err(e) = self.cache.compact(&compacted) {
                        warn!("Log compaction after save failed: {}", e);
                    }
                }
                saved
            }
            Err(e) => Err(e),
        };

        self.dirty.lock().unwrap().save_in_progress = false;
        match result {
            Ok(()) => {
                self.mark_clean();
                Ok(())
            }
            Err(e) => {
                error!("Save for '{}' failed: {}", self.project_id, e);
                Err(e)
            }
        }
    }

    // ----- presence and locking -----------------------------------------

    fn broadcast_presence(&self) {
        let user = self.awareness.lock().unwrap().local().clone();
        let msg = AssetMessage::AwarenessUpdate {
            user: Some(user),
            available_assets: None,
            leaving: false,
        };
        if let Err(e) = self.channel.send_asset(&msg) {
            debug!("Presence update not sent (offline): {}", e);
        }
    }

    pub fn set_selected_page(&self, page_id: Option<String>) {
        self.awareness.lock().unwrap().set_selected_page(page_id);
        self.broadcast_presence();
    }

    pub fn set_editing_component(&self, component_id: Option<String>) {
        self.awareness
            .lock()
            .unwrap()
            .set_editing_component(component_id);
        self.broadcast_presence();
    }

    pub fn request_lock(&self, component_id: &str) -> Result<bool, SyncError> {
        let holder = self.awareness.lock().unwrap().local().user_id.clone();
        self.locks.request_lock(component_id, &holder)
    }

    pub fn release_lock(&self, component_id: &str) -> Result<bool, SyncError> {
        let holder = self.awareness.lock().unwrap().local().user_id.clone();
        self.locks.release_lock(component_id, &holder)
    }

    pub fn is_locked(&self, component_id: &str) -> Result<Option<LockInfo>, SyncError> {
        self.locks.lock_info(component_id)
    }

    pub fn online_users(&self) -> Vec<AwarenessState> {
        self.awareness.lock().unwrap().online_users()
    }

    pub fn users_on_page(&self, page_id: &str) -> Vec<AwarenessState> {
        self.awareness.lock().unwrap().users_on_page(page_id)
    }

    pub fn users_editing_component(&self, component_id: &str) -> Vec<AwarenessState> {
        self.awareness
            .lock()
            .unwrap()
            .users_editing_component(component_id)
    }

    // ----- teardown ------------------------------------------------------

    /// Best-effort save on the cancelable leave path. Failures are logged,
    /// never thrown: the user may still cancel the navigation.
    pub async fn graceful_shutdown(&self) {
        if self.is_dirty() {
            if let Err(e) = self.save_to_server().await {
                warn!("Graceful save on shutdown failed: {}", e);
            }
        }
    }

    /// Unconditional final-unload path: clear presence for peers, fire a
    /// non-blocking beacon save if needed, and drop the connection. Runs even
    /// when the graceful path was skipped or cancelled.
    pub fn final_unload(&self) {
        let user = self.awareness.lock().unwrap().local().clone();
        let leave = AssetMessage::AwarenessUpdate {
            user: Some(user),
            available_assets: None,
            leaving: true,
        };
        if let Err(e) = self.channel.send_asset(&leave) {
            debug!("Presence clear not sent (offline): {}", e);
        }
        self.awareness.lock().unwrap().clear_peers();
        if self.is_dirty() {
            if let Ok(snapshot) = self.encode_snapshot() {
                self.store.save_document_beacon(&self.project_id, snapshot);
            }
        }
        self.channel.disconnect();
    }
}

fn mark_dirty(dirty: &Mutex<DirtyState>, listeners: &Mutex<Vec<DirtyListener>>) {
    {
        let mut state = dirty.lock().unwrap();
        if state.is_dirty {
            // Already dirty: the notification must not re-fire.
            return;
        }
        state.is_dirty = true;
    }
    for listener in listeners.lock().unwrap().iter() {
        listener();
    }
}
