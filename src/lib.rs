//! Client-side synchronization engine for the coauthor authoring tool.
//!
//! One instance per open document. A [`session::DocSession`] keeps a local
//! CRDT replica converged with peers over a shared duplex channel, backed by
//! a durable on-disk cache so sessions survive restarts and offline periods.
//! An [`assets::AssetCoordinator`] rides the same channel and makes every
//! referenced binary asset eventually available locally, with prioritized,
//! preemptible transfers against the authoritative store.
//!
//! The channel multiplexes two protocols by a one-byte marker: marked frames
//! carry JSON asset-protocol messages, unmarked frames are opaque CRDT sync
//! updates. See [`net`] for the framing rules.

pub mod assets;
pub mod cache;
pub mod clients;
pub mod config;
pub mod models;
pub mod net;
pub mod session;

pub use assets::{AssetCoordinator, AssetEvent};
pub use clients::StoreClient;
pub use config::Config;
pub use models::{AssetMessage, SyncError, TransferReason};
pub use net::{connect_channel, ChannelHandle, ChannelStatus};
pub use session::{DocSession, TxnOrigin};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing for embedding applications.
///
/// `RUST_LOG` wins when set; otherwise `fallback` (typically
/// [`Config::log_level`]) becomes the default directive.
pub fn init_tracing(fallback: &str) {
    let directive = format!("coauthor_sync={},info", fallback);
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| directive.into()))
        .init();
}
