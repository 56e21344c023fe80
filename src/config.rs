use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::models::SyncError;

/// Client configuration, loaded from environment variables or an app.env file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// WebSocket URL of the shared duplex channel.
    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    /// Base URL of the authoritative store HTTP API.
    #[serde(default = "default_store_base_url")]
    pub store_base_url: String,

    /// Bearer token for authenticated store calls.
    pub bearer_token: Option<String>,

    /// Skip all network activity and work from the local cache only.
    #[serde(default)]
    pub offline: bool,

    /// Directory holding the per-document durable cache files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// URI scheme used for embedded asset references in content.
    #[serde(default = "default_asset_scheme")]
    pub asset_scheme: String,

    /// How long an asset request waits before resolving to "not available".
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Bound on the wait for peer convergence during session init.
    #[serde(default = "default_convergence_timeout_ms")]
    pub convergence_timeout_ms: u64,

    /// Pause between items of a sequential bulk upload.
    #[serde(default = "default_upload_pacing_ms")]
    pub upload_pacing_ms: u64,

    /// Pause between items of a sequential prefetch run.
    #[serde(default = "default_prefetch_pacing_ms")]
    pub prefetch_pacing_ms: u64,

    /// Largest bulk upload batch accepted before the store starts rejecting.
    #[serde(default = "default_max_bulk_batch")]
    pub max_bulk_batch: usize,

    /// Grace period before tearing the session down on access revocation.
    #[serde(default = "default_revoke_grace_ms")]
    pub revoke_grace_ms: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, SyncError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(SyncError::Config(e.to_string()))
            }
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn convergence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.convergence_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_url: default_channel_url(),
            store_base_url: default_store_base_url(),
            bearer_token: None,
            offline: false,
            cache_dir: default_cache_dir(),
            log_level: default_log_level(),
            asset_scheme: default_asset_scheme(),
            request_timeout_ms: default_request_timeout_ms(),
            convergence_timeout_ms: default_convergence_timeout_ms(),
            upload_pacing_ms: default_upload_pacing_ms(),
            prefetch_pacing_ms: default_prefetch_pacing_ms(),
            max_bulk_batch: default_max_bulk_batch(),
            revoke_grace_ms: default_revoke_grace_ms(),
        }
    }
}

// Default value functions
fn default_channel_url() -> String {
    "ws://127.0.0.1:3001/sync".to_string()
}

fn default_store_base_url() -> String {
    "http://127.0.0.1:3000/api".to_string()
}

fn default_cache_dir() -> String {
    "./cache".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_asset_scheme() -> String {
    "asset".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_convergence_timeout_ms() -> u64 {
    3_000
}

fn default_upload_pacing_ms() -> u64 {
    200
}

fn default_prefetch_pacing_ms() -> u64 {
    150
}

fn default_max_bulk_batch() -> usize {
    50
}

fn default_revoke_grace_ms() -> u64 {
    2_000
}
