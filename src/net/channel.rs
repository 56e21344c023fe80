use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::{AssetMessage, SyncError};

/// Reserved leading byte that marks a binary frame as an asset-protocol
/// message. Every other binary frame on the channel is an opaque CRDT sync
/// frame and is passed through untouched. This discriminator is part of the
/// wire contract and must not change.
pub const FRAME_MARKER: u8 = 0xFF;

/// Encode an asset message as a marker-prefixed binary frame.
pub fn encode_frame(msg: &AssetMessage) -> Result<Vec<u8>, SyncError> {
    let json = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(json.len() + 1);
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decode a binary frame. Returns None for frames without the marker byte
/// (those belong to the CRDT layer) and for marker frames whose JSON body is
/// unreadable; the latter is logged and dropped, never bubbled up.
pub fn decode_frame(frame: &[u8]) -> Option<AssetMessage> {
    if frame.first() != Some(&FRAME_MARKER) {
        return None;
    }
    match serde_json::from_slice::<AssetMessage>(&frame[1..]) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Dropping undecodable asset-protocol frame: {}", e);
            None
        }
    }
}

/// Legacy clients used to send asset messages as plain text frames. Tolerated
/// on receipt for backward compatibility; never emitted.
pub fn decode_legacy_text(text: &str) -> Option<AssetMessage> {
    match serde_json::from_str::<AssetMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("Ignoring non-protocol text frame: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Handle to the shared duplex channel carrying both CRDT sync traffic and
/// the asset protocol. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHandle {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    status_rx: watch::Receiver<ChannelStatus>,
    auto_reconnect: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl ChannelHandle {
    /// Send an asset-protocol message, marker-framed.
    pub fn send_asset(&self, msg: &AssetMessage) -> Result<(), SyncError> {
        let frame = encode_frame(msg)?;
        self.out_tx.send(frame).map_err(|_| SyncError::NotConnected)
    }

    /// Send an opaque CRDT sync frame, untouched.
    pub fn send_crdt(&self, frame: Vec<u8>) -> Result<(), SyncError> {
        self.out_tx.send(frame).map_err(|_| SyncError::NotConnected)
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status_rx.borrow() == ChannelStatus::Connected
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Force-disconnect and stop reconnecting. Used by the unload path and
    /// when access is revoked.
    pub fn disconnect(&self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.close.notify_waiters();
    }
}

/// Receiving ends of the demultiplexed channel: one inbox per protocol.
pub struct ChannelInbound {
    pub asset_rx: mpsc::UnboundedReceiver<AssetMessage>,
    pub crdt_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn route_binary(
    frame: &[u8],
    asset_tx: &mpsc::UnboundedSender<AssetMessage>,
    crdt_tx: &mpsc::UnboundedSender<Vec<u8>>,
) {
    if frame.first() == Some(&FRAME_MARKER) {
        if let Some(msg) = decode_frame(frame) {
            let _ = asset_tx.send(msg);
        }
    } else {
        let _ = crdt_tx.send(frame.to_vec());
    }
}

/// Connect the duplex websocket channel.
///
/// The connection task reconnects with backoff for as long as auto-reconnect
/// is enabled; each successful (re)connect re-publishes `Connected` on the
/// status watch so the coordinator re-installs itself, re-announces and
/// re-syncs metadata against the fresh connection.
pub fn connect_channel(url: String) -> (ChannelHandle, ChannelInbound) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (asset_tx, asset_rx) = mpsc::unbounded_channel();
    let (crdt_tx, crdt_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
    let auto_reconnect = Arc::new(AtomicBool::new(true));
    let close = Arc::new(Notify::new());

    let handle = ChannelHandle {
        out_tx,
        status_rx,
        auto_reconnect: auto_reconnect.clone(),
        close: close.clone(),
    };

    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            let _ = status_tx.send(ChannelStatus::Connecting);
            match connect_async(url.as_str()).await {
                Ok((ws, _resp)) => {
                    info!("Channel connected to {}", url);
                    backoff = Duration::from_secs(1);
                    let _ = status_tx.send(ChannelStatus::Connected);
                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            outbound = out_rx.recv() => match outbound {
                                Some(frame) => {
                                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                                        warn!("Channel send failed: {}", e);
                                        break;
                                    }
                                }
                                // Every handle is gone; nothing left to do.
                                None => {
                                    let _ = status_tx.send(ChannelStatus::Disconnected);
                                    return;
                                }
                            },
                            _ = close.notified() => {
                                let _ = sink.close().await;
                                let _ = status_tx.send(ChannelStatus::Disconnected);
                                info!("Channel closed on request");
                                return;
                            },
                            inbound = stream.next() => match inbound {
                                Some(Ok(Message::Binary(data))) => {
                                    route_binary(data.as_ref(), &asset_tx, &crdt_tx);
                                }
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(msg) = decode_legacy_text(text.as_str()) {
                                        let _ = asset_tx.send(msg);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Channel receive error: {}", e);
                                    break;
                                }
                            },
                        }
                    }
                    let _ = status_tx.send(ChannelStatus::Disconnected);
                }
                Err(e) => {
                    error!("Channel connect to {} failed: {}", url, e);
                    let _ = status_tx.send(ChannelStatus::Disconnected);
                }
            }

            if !auto_reconnect.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = close.notified() => return,
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    });

    (
        handle,
        ChannelInbound { asset_rx, crdt_rx },
    )
}

/// The far side of an in-process channel pair: what the handle sent, and a
/// way to inject inbound frames. Used by tests and embedded harnesses.
pub struct InProcessPeer {
    pub sent_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    asset_tx: mpsc::UnboundedSender<AssetMessage>,
    crdt_tx: mpsc::UnboundedSender<Vec<u8>>,
    status_tx: watch::Sender<ChannelStatus>,
}

impl InProcessPeer {
    /// Deliver a raw binary frame as if it arrived on the wire.
    pub fn inject_binary(&self, frame: &[u8]) {
        route_binary(frame, &self.asset_tx, &self.crdt_tx);
    }

    /// Deliver a legacy plain-text frame.
    pub fn inject_text(&self, text: &str) {
        if let Some(msg) = decode_legacy_text(text) {
            let _ = self.asset_tx.send(msg);
        }
    }

    pub fn inject_asset(&self, msg: &AssetMessage) {
        let frame = encode_frame(msg).expect("encodable message");
        self.inject_binary(&frame);
    }

    pub fn set_status(&self, status: ChannelStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Collect every frame sent so far without waiting.
    pub fn drain_sent(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

impl ChannelHandle {
    /// Build an in-process channel pair with no socket underneath.
    pub fn in_process() -> (ChannelHandle, ChannelInbound, InProcessPeer) {
        let (out_tx, sent_rx) = mpsc::unbounded_channel();
        let (asset_tx, asset_rx) = mpsc::unbounded_channel();
        let (crdt_tx, crdt_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connected);

        let handle = ChannelHandle {
            out_tx,
            status_rx,
            auto_reconnect: Arc::new(AtomicBool::new(true)),
            close: Arc::new(Notify::new()),
        };
        // Mirror the socket-backed task: a close request flips the status.
        {
            let close = handle.close.clone();
            let status_tx = status_tx.clone();
            tokio::spawn(async move {
                close.notified().await;
                let _ = status_tx.send(ChannelStatus::Disconnected);
            });
        }
        let peer = InProcessPeer {
            sent_rx,
            asset_tx,
            crdt_tx,
            status_tx,
        };
        (handle, ChannelInbound { asset_rx, crdt_rx }, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferReason;
    use uuid::Uuid;

    #[test]
    fn frame_round_trip_is_byte_identical() {
        let msg = AssetMessage::RequestAsset {
            asset_id: Uuid::new_v4(),
            priority: 90,
            reason: TransferReason::Render,
        };
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame[0], FRAME_MARKER);

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);

        // Re-encoding the decoded message yields the same JSON bytes.
        let reframed = encode_frame(&decoded).unwrap();
        assert_eq!(reframed, frame);
    }

    #[test]
    fn crdt_looking_frames_are_never_parsed() {
        // A frame that happens to contain valid JSON but lacks the marker.
        let crdt_frame = br#"{"type":"request-asset","data":{}}"#;
        assert!(decode_frame(crdt_frame).is_none());
        // Marker frame with garbage JSON is dropped, not an error.
        assert!(decode_frame(&[FRAME_MARKER, 0x00, 0x01]).is_none());
        // Empty frame.
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn legacy_text_frames_are_tolerated() {
        let msg = AssetMessage::AssetNotFound {
            asset_id: Uuid::new_v4(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(decode_legacy_text(&text), Some(msg));
        assert_eq!(decode_legacy_text("ping"), None);
    }

    #[tokio::test]
    async fn in_process_pair_demultiplexes_by_marker() {
        let (handle, mut inbound, mut peer) = ChannelHandle::in_process();

        // Outbound asset message arrives marker-framed on the peer side.
        let msg = AssetMessage::SlotAvailable {};
        handle.send_asset(&msg).unwrap();
        let sent = peer.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], FRAME_MARKER);

        // Inbound: marked frame goes to the asset inbox, unmarked to the CRDT inbox.
        peer.inject_asset(&msg);
        peer.inject_binary(&[0x01, 0x02, 0x03]);
        assert_eq!(inbound.asset_rx.recv().await.unwrap(), msg);
        assert_eq!(inbound.crdt_rx.recv().await.unwrap(), vec![0x01, 0x02, 0x03]);
    }
}
