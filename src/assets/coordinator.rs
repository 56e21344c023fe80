use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::queue::TransferQueue;
use crate::assets::scan::extract_asset_refs;
use crate::cache::DurableCache;
use crate::clients::StoreClient;
use crate::config::Config;
use crate::models::{
    AssetMessage, AssetRecord, BulkUploadFailure, BulkUploadItem, BulkUploadReport, SyncError,
    TransferReason, PRIORITY_NAVIGATION, PRIORITY_PREEMPTED_LOW, PRIORITY_RENDER,
};
use crate::net::{ChannelHandle, ChannelStatus};
use crate::session::AwarenessRegistry;

/// Events the coordinator surfaces to the embedding UI layer. Emission is
/// synchronous and order-preserving.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetEvent {
    Received {
        asset_id: Uuid,
    },
    NotFound {
        asset_id: Uuid,
    },
    PriorityAck {
        asset_id: Uuid,
        queue_position: Option<usize>,
        estimated_wait_ms: Option<u64>,
    },
    Preempted {
        asset_id: Uuid,
    },
    SlotAvailable,
    AccessRevoked {
        reason: Option<String>,
    },
}

type EventListener = Arc<dyn Fn(&AssetEvent) + Send + Sync>;

/// One outstanding asset fetch. At most one exists per asset id; duplicate
/// requests coalesce onto the same entry as extra waiters.
struct PendingRequest {
    waiters: Vec<oneshot::Sender<bool>>,
    timeout: AbortHandle,
}

/// A prefetch batch deferred by a delay hint. Two edges converge on the same
/// "start prefetch" action: the fallback timer, and a bulk-upload-complete
/// from the uploading peer. Taking the Option makes execution at-most-once.
struct PendingPrefetch {
    ids: Vec<Uuid>,
    timer: AbortHandle,
}

#[derive(Default)]
struct CoordState {
    pending: HashMap<Uuid, PendingRequest>,
    active_uploads: HashMap<Uuid, AbortHandle>,
    queue: TransferQueue,
    pending_prefetch: Option<PendingPrefetch>,
}

/// Makes any referenced asset eventually available locally, announces local
/// availability, and serves peer-to-peer transfer requests, all over the
/// same duplex channel as the CRDT sync traffic.
pub struct AssetCoordinator {
    project_id: String,
    config: Config,
    cache: Arc<DurableCache>,
    store: Arc<StoreClient>,
    channel: ChannelHandle,
    state: Mutex<CoordState>,
    listeners: Mutex<Vec<EventListener>>,
    presence: Mutex<Option<Arc<Mutex<AwarenessRegistry>>>>,
}

impl AssetCoordinator {
    pub fn new(
        project_id: &str,
        config: Config,
        cache: Arc<DurableCache>,
        store: Arc<StoreClient>,
        channel: ChannelHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            project_id: project_id.to_string(),
            config,
            cache,
            store,
            channel,
            state: Mutex::new(CoordState::default()),
            listeners: Mutex::new(Vec::new()),
            presence: Mutex::new(None),
        })
    }

    /// Let inbound awareness updates flow into the session's presence registry.
    pub fn attach_presence(&self, registry: Arc<Mutex<AwarenessRegistry>>) {
        *self.presence.lock().unwrap() = Some(registry);
    }

    pub fn subscribe(&self, listener: Box<dyn Fn(&AssetEvent) + Send + Sync>) {
        self.listeners.lock().unwrap().push(Arc::from(listener));
    }

    /// Invokes listeners outside the registry lock so a callback may call
    /// `subscribe` itself without deadlocking.
    fn emit(&self, event: &AssetEvent) {
        let listeners: Vec<EventListener> = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener(event);
        }
    }

    /// Main loop: dispatch inbound asset-protocol messages and re-run the
    /// connection bootstrap every time the (possibly replaced) underlying
    /// connection reports connected.
    pub async fn run(self: Arc<Self>, mut asset_rx: mpsc::UnboundedReceiver<AssetMessage>) {
        let mut status = self.channel.status();
        let mut status_open = true;
        if self.channel.is_connected() {
            self.on_connected().await;
        }
        loop {
            tokio::select! {
                changed = status.changed(), if status_open => match changed {
                    Ok(()) => {
                        let current = *status.borrow_and_update();
                        match current {
                            ChannelStatus::Connected => self.on_connected().await,
                            // Peer presence is only meaningful while the
                            // connection is up; drop it on disconnect.
                            ChannelStatus::Disconnected => {
                                if let Some(registry) = self.presence.lock().unwrap().as_ref() {
                                    registry.lock().unwrap().clear_peers();
                                }
                            }
                            ChannelStatus::Connecting => {}
                        }
                    }
                    // Connection task is gone; keep draining messages.
                    Err(_) => status_open = false,
                },
                msg = asset_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }
        debug!("Asset coordinator for '{}' stopped", self.project_id);
    }

    /// Connection bootstrap: announce what we can serve, then pull asset
    /// metadata (never blobs) so collaborators' uploads become visible
    /// without forcing downloads.
    async fn on_connected(self: &Arc<Self>) {
        self.announce();
        if !self.config.offline {
            match self.sync_store_metadata().await {
                Ok(count) => debug!("Merged metadata for {} store assets", count),
                Err(e) => warn!("Asset metadata sync failed: {}", e),
            }
        }
    }

    /// Announce the asset ids this peer can actually serve. Metadata-only
    /// records never appear here; the durable cache decides.
    pub fn announce(&self) {
        let ids = match self.cache.blob_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Cannot announce availability: {}", e);
                return;
            }
        };
        let msg = AssetMessage::AwarenessUpdate {
            user: None,
            available_assets: Some(ids),
            leaving: false,
        };
        if let Err(e) = self.channel.send_asset(&msg) {
            debug!("Availability announcement not sent: {}", e);
        }
    }

    /// Merge the store's metadata listing into local records, without
    /// overwriting anything the local cache already knows about blobs.
    pub async fn sync_store_metadata(&self) -> Result<usize, SyncError> {
        let metas = self.store.list_assets(&self.project_id).await?;
        let count = metas.len();
        for meta in &metas {
            self.cache.merge_meta(&AssetRecord::from(meta))?;
        }
        Ok(count)
    }

    /// Every asset record currently known, blob-backed or metadata-only.
    pub fn asset_records(&self) -> Result<Vec<AssetRecord>, SyncError> {
        self.cache.list_meta()
    }

    // ----- requesting ----------------------------------------------------

    /// Ask the network for an asset. Resolves true once the blob is locally
    /// available, false on not-found or timeout; never fails.
    ///
    /// A second request for an id already pending attaches to the existing
    /// outcome instead of issuing a duplicate wire message; the refreshed
    /// priority still goes out.
    pub async fn request_asset(
        self: &Arc<Self>,
        asset_id: Uuid,
        priority: u8,
        reason: TransferReason,
    ) -> bool {
        // The durable cache is consulted before anything is declared missing.
        if self.cache.has_blob(asset_id).unwrap_or(false) {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pending) = state.pending.get_mut(&asset_id) {
                pending.waiters.push(tx);
                state.queue.update_priority(asset_id, priority, reason);
                drop(state);
                let _ = self.channel.send_asset(&AssetMessage::PriorityUpdate {
                    asset_id,
                    priority,
                    reason,
                });
            } else {
                state.queue.enqueue(asset_id, priority, reason);
                let timeout = {
                    let this = self.clone();
                    let wait = self.config.request_timeout();
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        if this.resolve_pending(asset_id, false) {
                            debug!("Asset request '{}' timed out", asset_id);
                        }
                    })
                    .abort_handle()
                };
                state.pending.insert(
                    asset_id,
                    PendingRequest {
                        waiters: vec![tx],
                        timeout,
                    },
                );
                drop(state);
                let _ = self.channel.send_asset(&AssetMessage::RequestAsset {
                    asset_id,
                    priority,
                    reason,
                });
            }
        }
        rx.await.unwrap_or(false)
    }

    /// Settle the pending request for an id, waking every coalesced waiter.
    fn resolve_pending(&self, asset_id: Uuid, available: bool) -> bool {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.queue.remove(asset_id);
            state.pending.remove(&asset_id)
        };
        match entry {
            Some(pending) => {
                pending.timeout.abort();
                for waiter in pending.waiters {
                    let _ = waiter.send(available);
                }
                true
            }
            None => false,
        }
    }

    /// Scan a content blob for embedded asset references and request every
    /// locally-missing one, fire-and-forget. Returns the missing set.
    pub fn scan_content(self: &Arc<Self>, content: &str) -> Vec<Uuid> {
        let refs = extract_asset_refs(content, &self.config.asset_scheme);
        let missing: Vec<Uuid> = refs
            .into_iter()
            .filter(|id| !self.cache.has_blob(*id).unwrap_or(false))
            .collect();
        for id in &missing {
            let this = self.clone();
            let id = *id;
            tokio::spawn(async move {
                if !this
                    .request_asset(id, PRIORITY_RENDER, TransferReason::Render)
                    .await
                {
                    debug!("Referenced asset '{}' could not be fetched", id);
                }
            });
        }
        missing
    }

    /// Report a priority change locally and to the coordinator.
    pub fn update_priority(&self, asset_id: Uuid, priority: u8, reason: TransferReason) {
        self.state
            .lock()
            .unwrap()
            .queue
            .update_priority(asset_id, priority, reason);
        let _ = self.channel.send_asset(&AssetMessage::PriorityUpdate {
            asset_id,
            priority,
            reason,
        });
    }

    /// The user navigated to a page: boost every queued asset on it and let
    /// the coordinator know.
    pub fn navigation_hint(&self, page_id: &str, asset_ids: &[Uuid]) {
        {
            let mut state = self.state.lock().unwrap();
            for id in asset_ids {
                if state.queue.contains(*id) {
                    state
                        .queue
                        .update_priority(*id, PRIORITY_NAVIGATION, TransferReason::Navigation);
                }
            }
        }
        let _ = self.channel.send_asset(&AssetMessage::NavigationHint {
            page_id: page_id.to_string(),
            asset_ids: asset_ids.to_vec(),
        });
    }

    // ----- inbound dispatch ----------------------------------------------

    async fn handle_message(self: &Arc<Self>, msg: AssetMessage) {
        match msg {
            AssetMessage::AwarenessUpdate {
                user,
                available_assets,
                leaving,
            } => {
                if let Some(assets) = &available_assets {
                    debug!("Peer announced {} available assets", assets.len());
                }
                if let Some(user) = user {
                    if let Some(registry) = &*self.presence.lock().unwrap() {
                        let mut registry = registry.lock().unwrap();
                        if leaving {
                            registry.remove_peer(&user.user_id);
                        } else {
                            registry.apply_peer(user);
                        }
                    }
                }
            }
            AssetMessage::UploadRequest {
                asset_id,
                upload_url,
            } => self.spawn_upload(asset_id, upload_url),
            AssetMessage::BulkUploadRequest { batch_id, assets } => {
                let this = self.clone();
                tokio::spawn(async move {
                    let report = this.bulk_upload(&batch_id, &assets).await;
                    info!(
                        "Bulk upload '{}': {} completed, {} failed",
                        batch_id, report.completed, report.failed
                    );
                });
            }
            AssetMessage::BulkUploadComplete { asset_ids } => {
                debug!(
                    "Peer finished uploading {} assets; they are now fetchable",
                    asset_ids.len()
                );
                self.trigger_deferred_prefetch();
            }
            AssetMessage::AssetReady {
                asset_id,
                download_url,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.fetch_ready_asset(asset_id, &download_url).await;
                });
            }
            AssetMessage::AssetNotFound { asset_id } => {
                self.resolve_pending(asset_id, false);
                self.emit(&AssetEvent::NotFound { asset_id });
            }
            AssetMessage::PrefetchAssets {
                asset_ids,
                delay_ms,
            } => self.handle_prefetch(asset_ids, delay_ms),
            AssetMessage::PriorityAck {
                asset_id,
                queue_position,
                estimated_wait_ms,
            } => {
                self.emit(&AssetEvent::PriorityAck {
                    asset_id,
                    queue_position,
                    estimated_wait_ms,
                });
            }
            AssetMessage::PreemptUpload { asset_id } => self.handle_preempt(asset_id),
            AssetMessage::ResumeUpload { asset_id, priority } => {
                if let Some(priority) = priority {
                    self.state.lock().unwrap().queue.update_priority(
                        asset_id,
                        priority,
                        TransferReason::Preempted,
                    );
                }
            }
            AssetMessage::SlotAvailable {} => self.emit(&AssetEvent::SlotAvailable),
            AssetMessage::AccessRevoked { reason } => self.handle_access_revoked(reason),
            // Outbound-direction messages looped back by a relay carry no work.
            other => debug!("Ignoring outbound-direction message: {:?}", other),
        }
    }

    // ----- uploads --------------------------------------------------------

    /// Serve an upload request from the coordinator. The transfer runs as its
    /// own task so a preemption message can abort it out-of-band.
    fn spawn_upload(self: &Arc<Self>, asset_id: Uuid, upload_url: String) {
        let this = self.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // Wait until our abort handle is registered before transferring.
            let _ = ready_rx.await;
            let result = this.upload_one(asset_id, &upload_url).await;
            this.state.lock().unwrap().active_uploads.remove(&asset_id);
            let reply = match result {
                Ok(size) => AssetMessage::AssetUploaded {
                    asset_id,
                    success: true,
                    size: Some(size),
                    error: None,
                },
                Err(e) => {
                    warn!("Upload of '{}' failed: {}", asset_id, e);
                    AssetMessage::AssetUploaded {
                        asset_id,
                        success: false,
                        size: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = this.channel.send_asset(&reply);
        });
        self.state
            .lock()
            .unwrap()
            .active_uploads
            .insert(asset_id, task.abort_handle());
        let _ = ready_tx.send(());
    }

    /// Upload one blob from the local cache. A missing blob is reported as a
    /// failure, never silently ignored.
    async fn upload_one(&self, asset_id: Uuid, upload_url: &str) -> Result<u64, SyncError> {
        let blob = self
            .cache
            .get_blob(asset_id)?
            .ok_or(SyncError::AssetNotFound(asset_id))?;
        let (filename, mime) = match self.cache.get_meta(asset_id)? {
            Some(meta) => (meta.filename, meta.mime),
            None => (asset_id.to_string(), "application/octet-stream".to_string()),
        };
        let size = self.store.upload_blob(upload_url, &filename, &mime, blob).await?;
        if let Some(mut meta) = self.cache.get_meta(asset_id)? {
            meta.uploaded_to_store = true;
            self.cache.put_meta(&meta)?;
        }
        Ok(size)
    }

    /// Upload a batch strictly sequentially with inter-upload pacing so the
    /// store is never overwhelmed. Per-asset failures are collected and never
    /// abort the rest of the batch. Progress goes out every 5 completions and
    /// unconditionally for the final item.
    pub async fn bulk_upload(
        &self,
        batch_id: &str,
        items: &[BulkUploadItem],
    ) -> BulkUploadReport {
        let total = items.len();
        let limit = self.config.max_bulk_batch;
        let mut report = BulkUploadReport::default();

        for (idx, item) in items.iter().enumerate() {
            if idx >= limit {
                report.failed += 1;
                report.failures.push(BulkUploadFailure {
                    asset_id: item.asset_id,
                    error: format!("batch limit of {} exceeded", limit),
                });
            } else {
                match self.upload_one(item.asset_id, &item.upload_url).await {
                    Ok(_) => report.completed += 1,
                    Err(e) => {
                        warn!(
                            "Bulk upload '{}': asset '{}' failed: {}",
                            batch_id, item.asset_id, e
                        );
                        report.failed += 1;
                        report.failures.push(BulkUploadFailure {
                            asset_id: item.asset_id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            let done = idx + 1;
            if done % 5 == 0 || done == total {
                let _ = self.channel.send_asset(&AssetMessage::BulkUploadProgress {
                    batch_id: batch_id.to_string(),
                    completed: report.completed,
                    failed: report.failed,
                    total,
                });
            }
            if done < total {
                tokio::time::sleep(Duration::from_millis(self.config.upload_pacing_ms)).await;
            }
        }
        report
    }

    /// Abort the named in-flight upload and put it back in the queue at the
    /// low tier so it still makes forward progress later.
    fn handle_preempt(&self, asset_id: Uuid) {
        let aborted = {
            let mut state = self.state.lock().unwrap();
            match state.active_uploads.remove(&asset_id) {
                Some(handle) => {
                    handle.abort();
                    state.queue.enqueue(
                        asset_id,
                        PRIORITY_PREEMPTED_LOW,
                        TransferReason::Preempted,
                    );
                    true
                }
                None => false,
            }
        };
        if aborted {
            info!("Upload of '{}' preempted and re-queued at low priority", asset_id);
            self.emit(&AssetEvent::Preempted { asset_id });
        } else {
            debug!("Preempt for '{}' ignored: no active upload", asset_id);
        }
    }

    // ----- downloads ------------------------------------------------------

    /// An asset became available for download: fetch it, persist blob and
    /// header metadata, and settle any pending request.
    async fn fetch_ready_asset(self: &Arc<Self>, asset_id: Uuid, download_url: &str) {
        match self.store.download_from(download_url, asset_id).await {
            Ok((bytes, record)) => {
                if let Err(e) = self.cache.put_blob(asset_id, &bytes) {
                    warn!("Failed to persist blob '{}': {}", asset_id, e);
                    return;
                }
                if let Err(e) = self.cache.merge_meta(&record) {
                    warn!("Failed to persist metadata for '{}': {}", asset_id, e);
                }
                let _ = self.cache.set_blob_present(asset_id);
                self.resolve_pending(asset_id, true);
                self.emit(&AssetEvent::Received { asset_id });
            }
            // The request timeout still guards the waiters.
            Err(e) => warn!("Download of ready asset '{}' failed: {}", asset_id, e),
        }
    }

    /// Warm the cache with the locally-missing subset of a hinted id set.
    /// With a delay hint the batch is parked until either the fallback timer
    /// fires or a bulk-upload-complete arrives, whichever is first.
    fn handle_prefetch(self: &Arc<Self>, asset_ids: Vec<Uuid>, delay_ms: Option<u64>) {
        let missing: Vec<Uuid> = asset_ids
            .into_iter()
            .filter(|id| !self.cache.has_blob(*id).unwrap_or(false))
            .collect();
        if missing.is_empty() {
            return;
        }

        match delay_ms {
            Some(delay) => {
                let timer = {
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        this.trigger_deferred_prefetch();
                    })
                    .abort_handle()
                };
                let mut state = self.state.lock().unwrap();
                let mut ids = missing;
                if let Some(old) = state.pending_prefetch.take() {
                    old.timer.abort();
                    for id in old.ids {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                state.pending_prefetch = Some(PendingPrefetch { ids, timer });
            }
            None => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_prefetch(missing).await;
                });
            }
        }
    }

    /// Fire the deferred prefetch batch, if one is parked. Both the fallback
    /// timer and the bulk-upload-complete signal land here; whichever comes
    /// first takes the batch and the other finds nothing.
    fn trigger_deferred_prefetch(self: &Arc<Self>) {
        let parked = self.state.lock().unwrap().pending_prefetch.take();
        if let Some(parked) = parked {
            parked.timer.abort();
            let this = self.clone();
            tokio::spawn(async move {
                this.run_prefetch(parked.ids).await;
            });
        }
    }

    /// Sequential download run with inter-item pacing; individual failures
    /// are logged and the run continues.
    async fn run_prefetch(self: &Arc<Self>, ids: Vec<Uuid>) {
        let total = ids.len();
        info!("Prefetching {} assets for '{}'", total, self.project_id);
        for (idx, id) in ids.into_iter().enumerate() {
            if !self.cache.has_blob(id).unwrap_or(false) {
                match self.store.download_asset(&self.project_id, id).await {
                    Ok((bytes, record)) => {
                        if let Err(e) = self.cache.put_blob(id, &bytes) {
                            warn!("Failed to persist prefetched blob '{}': {}", id, e);
                        } else {
                            let _ = self.cache.merge_meta(&record);
                            let _ = self.cache.set_blob_present(id);
                            self.resolve_pending(id, true);
                            self.emit(&AssetEvent::Received { asset_id: id });
                        }
                    }
                    Err(e) => warn!("Prefetch of '{}' failed: {}", id, e),
                }
            }
            if idx + 1 < total {
                tokio::time::sleep(Duration::from_millis(self.config.prefetch_pacing_ms)).await;
            }
        }
    }

    // ----- teardown -------------------------------------------------------

    /// Access revoked is fatal for the session: stop reconnecting, tell the
    /// UI, and drop the connection after a short grace period.
    fn handle_access_revoked(self: &Arc<Self>, reason: Option<String>) {
        warn!(
            "Access to '{}' revoked: {}",
            self.project_id,
            reason.as_deref().unwrap_or("no reason given")
        );
        self.channel.set_auto_reconnect(false);
        self.emit(&AssetEvent::AccessRevoked {
            reason: reason.clone(),
        });
        let this = self.clone();
        let grace = Duration::from_millis(self.config.revoke_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.channel.disconnect();
        });
    }

    // ----- introspection --------------------------------------------------

    pub fn queued_priority(&self, asset_id: Uuid) -> Option<u8> {
        self.state.lock().unwrap().queue.priority_of(asset_id)
    }

    pub fn has_active_upload(&self, asset_id: Uuid) -> bool {
        self.state.lock().unwrap().active_uploads.contains_key(&asset_id)
    }

    pub fn pending_request_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn has_deferred_prefetch(&self) -> bool {
        self.state.lock().unwrap().pending_prefetch.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetRecord, AwarenessState, PRIORITY_PREFETCH, PRIORITY_SAVE};
    use crate::net::{decode_frame, InProcessPeer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> Config {
        Config {
            offline: true,
            upload_pacing_ms: 1,
            prefetch_pacing_ms: 1,
            revoke_grace_ms: 10,
            ..Default::default()
        }
    }

    fn test_cache(dir: &TempDir) -> Arc<DurableCache> {
        Arc::new(DurableCache::open(dir.path(), "doc-1").unwrap())
    }

    fn test_record(id: Uuid) -> AssetRecord {
        AssetRecord {
            id,
            mime: "image/png".to_string(),
            filename: format!("{}.png", id),
            folder_path: String::new(),
            size: 4,
            hash: None,
            has_local_blob: true,
            uploaded_to_store: false,
        }
    }

    fn build(
        cache: Arc<DurableCache>,
        store_url: &str,
        config: Config,
    ) -> (Arc<AssetCoordinator>, InProcessPeer) {
        let (handle, inbound, peer) = ChannelHandle::in_process();
        let store = Arc::new(StoreClient::new(store_url.to_string(), None));
        let coord = AssetCoordinator::new("proj-1", config, cache, store, handle);
        tokio::spawn(coord.clone().run(inbound.asset_rx));
        (coord, peer)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {}", what);
    }

    fn decode_sent(peer: &mut InProcessPeer) -> Vec<AssetMessage> {
        peer.drain_sent()
            .iter()
            .filter_map(|f| decode_frame(f))
            .collect()
    }

    fn find_headers_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    fn parse_content_length(head: &[u8]) -> usize {
        String::from_utf8_lossy(head)
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = stream.read(&mut tmp).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = find_headers_end(&buf) {
                let mut remaining = parse_content_length(&buf[..pos]).saturating_sub(buf.len() - pos);
                while remaining > 0 {
                    let n = stream.read(&mut tmp).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    remaining = remaining.saturating_sub(n);
                }
                return;
            }
        }
    }

    /// Accepts connections forever, answering each request with a fixed
    /// response after the full body has been consumed.
    async fn spawn_server(response: &'static [u8], hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    read_request(&mut stream).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.write_all(response).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    const OK_EMPTY: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    #[tokio::test]
    async fn duplicate_requests_coalesce_onto_one_wire_message() {
        let dir = TempDir::new().unwrap();
        let (coord, mut peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let id = Uuid::new_v4();

        let c1 = coord.clone();
        let first = tokio::spawn(async move {
            c1.request_asset(id, PRIORITY_RENDER, TransferReason::Render).await
        });
        wait_until(|| coord.pending_request_count() == 1, "first request registered").await;

        let c2 = coord.clone();
        let second = tokio::spawn(async move {
            c2.request_asset(id, PRIORITY_SAVE, TransferReason::Save).await
        });
        let mut sent = Vec::new();
        wait_until(
            || {
                sent.append(&mut decode_sent(&mut peer));
                sent.iter().any(|m| matches!(m, AssetMessage::RequestAsset { .. }))
                    && sent.iter().any(|m| matches!(m, AssetMessage::PriorityUpdate { .. }))
            },
            "both wire messages sent",
        )
        .await;

        let requests = sent
            .iter()
            .filter(|m| matches!(m, AssetMessage::RequestAsset { .. }))
            .count();
        let updates = sent
            .iter()
            .filter(|m| matches!(m, AssetMessage::PriorityUpdate { .. }))
            .count();
        assert_eq!(requests, 1, "second request must not duplicate the wire request");
        assert_eq!(updates, 1);
        assert_eq!(coord.pending_request_count(), 1);

        peer.inject_asset(&AssetMessage::AssetNotFound { asset_id: id });
        assert!(!first.await.unwrap());
        assert!(!second.await.unwrap());
        assert_eq!(coord.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn unanswered_request_resolves_false_after_timeout() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            request_timeout_ms: 50,
            ..test_config()
        };
        let (coord, _peer) = build(test_cache(&dir), "http://127.0.0.1:9", config);

        let available = coord
            .request_asset(Uuid::new_v4(), PRIORITY_PREFETCH, TransferReason::Prefetch)
            .await;
        assert!(!available);
        assert_eq!(coord.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn cached_asset_resolves_without_touching_the_wire() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let id = Uuid::new_v4();
        cache.put_blob(id, b"ping").unwrap();

        let (coord, mut peer) = build(cache, "http://127.0.0.1:9", test_config());
        assert!(coord.request_asset(id, PRIORITY_RENDER, TransferReason::Render).await);
        let sent = decode_sent(&mut peer);
        assert!(!sent.iter().any(|m| matches!(m, AssetMessage::RequestAsset { .. })));
    }

    #[tokio::test]
    async fn bulk_upload_reports_partial_failure_and_keeps_going() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let good_a = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let good_b = Uuid::new_v4();
        for id in [good_a, good_b] {
            cache.put_blob(id, b"ping").unwrap();
            cache.put_meta(&test_record(id)).unwrap();
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(OK_EMPTY, hits.clone()).await;
        let (coord, mut peer) = build(cache.clone(), &url, test_config());

        let items: Vec<BulkUploadItem> = [good_a, missing, good_b]
            .into_iter()
            .map(|asset_id| BulkUploadItem {
                asset_id,
                upload_url: format!("{}/upload", url),
            })
            .collect();
        let report = coord.bulk_upload("batch-1", &items).await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].asset_id, missing);
        // The item after the failed one was still attempted.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(cache.get_meta(good_b).unwrap().unwrap().uploaded_to_store);

        let sent = decode_sent(&mut peer);
        let last_progress = sent.iter().rev().find_map(|m| match m {
            AssetMessage::BulkUploadProgress {
                completed, failed, total, ..
            } => Some((*completed, *failed, *total)),
            _ => None,
        });
        assert_eq!(last_progress, Some((2, 1, 3)));
    }

    #[tokio::test]
    async fn preempted_upload_is_aborted_and_requeued_low() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let id = Uuid::new_v4();
        cache.put_blob(id, b"ping").unwrap();
        cache.put_meta(&test_record(id)).unwrap();

        // Server that never answers, so the upload stays in flight.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    read_request(&mut stream).await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let (coord, peer) = build(cache, &url, test_config());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coord.subscribe(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

        peer.inject_asset(&AssetMessage::UploadRequest {
            asset_id: id,
            upload_url: format!("{}/upload", url),
        });
        wait_until(|| coord.has_active_upload(id), "upload in flight").await;

        peer.inject_asset(&AssetMessage::PreemptUpload { asset_id: id });
        wait_until(|| !coord.has_active_upload(id), "upload aborted").await;
        assert_eq!(coord.queued_priority(id), Some(PRIORITY_PREEMPTED_LOW));
        assert!(events
            .lock()
            .unwrap()
            .contains(&AssetEvent::Preempted { asset_id: id }));
    }

    #[tokio::test]
    async fn announce_lists_only_blob_backed_assets() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let with_blob = Uuid::new_v4();
        let meta_only = Uuid::new_v4();
        cache.put_blob(with_blob, b"ping").unwrap();
        cache.put_meta(&test_record(with_blob)).unwrap();
        cache
            .put_meta(&AssetRecord {
                has_local_blob: false,
                ..test_record(meta_only)
            })
            .unwrap();

        let (_coord, mut peer) = build(cache, "http://127.0.0.1:9", test_config());

        let mut announced = None;
        wait_until(
            || {
                for msg in decode_sent(&mut peer) {
                    if let AssetMessage::AwarenessUpdate {
                        available_assets: Some(ids),
                        ..
                    } = msg
                    {
                        announced = Some(ids);
                    }
                }
                announced.is_some()
            },
            "availability announcement",
        )
        .await;
        assert_eq!(announced, Some(vec![with_blob]));
    }

    #[tokio::test]
    async fn asset_ready_downloads_persists_and_resolves_waiters() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let id = Uuid::new_v4();

        const READY: &[u8] = b"HTTP/1.1 200 OK\r\nx-original-mime: image/png\r\nx-filename: pic.png\r\ncontent-length: 4\r\nconnection: close\r\n\r\nping";
        let url = spawn_server(READY, Arc::new(AtomicUsize::new(0))).await;

        let (coord, peer) = build(cache.clone(), &url, test_config());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coord.subscribe(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

        let c = coord.clone();
        let waiter = tokio::spawn(async move {
            c.request_asset(id, PRIORITY_RENDER, TransferReason::Render).await
        });
        wait_until(|| coord.pending_request_count() == 1, "request registered").await;

        peer.inject_asset(&AssetMessage::AssetReady {
            asset_id: id,
            download_url: format!("{}/assets/{}", url, id),
        });

        assert!(waiter.await.unwrap());
        assert_eq!(cache.get_blob(id).unwrap().as_deref(), Some(b"ping".as_slice()));
        let meta = cache.get_meta(id).unwrap().unwrap();
        assert_eq!(meta.mime, "image/png");
        assert!(meta.has_local_blob);
        assert!(events
            .lock()
            .unwrap()
            .contains(&AssetEvent::Received { asset_id: id }));
    }

    #[tokio::test]
    async fn deferred_prefetch_fires_at_most_once() {
        let dir = TempDir::new().unwrap();
        let (coord, peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];

        peer.inject_asset(&AssetMessage::PrefetchAssets {
            asset_ids: ids.clone(),
            delay_ms: Some(60_000),
        });
        wait_until(|| coord.has_deferred_prefetch(), "prefetch parked").await;

        // The uploader finishing early releases the parked batch.
        peer.inject_asset(&AssetMessage::BulkUploadComplete { asset_ids: ids });
        wait_until(|| !coord.has_deferred_prefetch(), "prefetch released").await;
        // A second completion signal finds nothing to release.
        peer.inject_asset(&AssetMessage::BulkUploadComplete { asset_ids: vec![] });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!coord.has_deferred_prefetch());
    }

    #[tokio::test]
    async fn access_revoked_stops_reconnecting_and_disconnects() {
        let dir = TempDir::new().unwrap();
        let (coord, peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coord.subscribe(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

        peer.inject_asset(&AssetMessage::AccessRevoked {
            reason: Some("membership removed".to_string()),
        });
        wait_until(
            || {
                events
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|e| matches!(e, AssetEvent::AccessRevoked { .. }))
            },
            "revocation event",
        )
        .await;
        wait_until(|| !coord.channel.is_connected(), "channel closed after grace").await;
    }

    #[tokio::test]
    async fn navigation_hint_boosts_only_queued_assets() {
        let dir = TempDir::new().unwrap();
        let (coord, mut peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let queued = Uuid::new_v4();
        let unknown = Uuid::new_v4();

        let c = coord.clone();
        tokio::spawn(async move {
            c.request_asset(queued, PRIORITY_PREFETCH, TransferReason::Prefetch).await
        });
        wait_until(|| coord.pending_request_count() == 1, "request registered").await;

        coord.navigation_hint("page-1", &[queued, unknown]);
        assert_eq!(coord.queued_priority(queued), Some(PRIORITY_NAVIGATION));
        assert_eq!(coord.queued_priority(unknown), None);

        let sent = decode_sent(&mut peer);
        assert!(sent
            .iter()
            .any(|m| matches!(m, AssetMessage::NavigationHint { page_id, .. } if page_id == "page-1")));
    }

    #[tokio::test]
    async fn disconnect_clears_the_attached_peer_registry() {
        let dir = TempDir::new().unwrap();
        let (coord, peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let registry = Arc::new(Mutex::new(AwarenessRegistry::new(AwarenessState {
            user_id: "me".to_string(),
            name: "Me".to_string(),
            color: "#112233".to_string(),
            selected_page_id: None,
            editing_component_id: None,
        })));
        coord.attach_presence(registry.clone());

        peer.inject_asset(&AssetMessage::AwarenessUpdate {
            user: Some(AwarenessState {
                user_id: "them".to_string(),
                name: "Them".to_string(),
                color: "#445566".to_string(),
                selected_page_id: None,
                editing_component_id: None,
            }),
            available_assets: None,
            leaving: false,
        });
        wait_until(
            || registry.lock().unwrap().online_users().len() == 2,
            "peer presence applied",
        )
        .await;

        peer.set_status(ChannelStatus::Disconnected);
        wait_until(
            || registry.lock().unwrap().online_users().len() == 1,
            "peers cleared on disconnect",
        )
        .await;
    }

    #[tokio::test]
    async fn listeners_may_subscribe_from_inside_a_callback() {
        let dir = TempDir::new().unwrap();
        let (coord, peer) = build(test_cache(&dir), "http://127.0.0.1:9", test_config());
        let second_fired = Arc::new(AtomicUsize::new(0));

        let outer = coord.clone();
        let fired = second_fired.clone();
        coord.subscribe(Box::new(move |e| {
            if matches!(e, AssetEvent::SlotAvailable) {
                let fired = fired.clone();
                outer.subscribe(Box::new(move |e| {
                    if matches!(e, AssetEvent::SlotAvailable) {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
        }));

        peer.inject_asset(&AssetMessage::SlotAvailable {});
        // A hang here would mean emission still holds the registry lock.
        peer.inject_asset(&AssetMessage::SlotAvailable {});
        wait_until(|| second_fired.load(Ordering::SeqCst) == 1, "re-entrant listener ran").await;
    }
}
