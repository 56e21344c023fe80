use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::{AssetRecord, StoreAssetMeta, SyncError};

/// HTTP client for the authoritative store: full document state, asset
/// metadata listings, asset downloads and multipart uploads.
#[derive(Debug, Clone)]
pub struct StoreClient {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl StoreClient {
    pub fn new(base_url: String, bearer_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn bearer(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    /// The store answering 401/403 means our access is gone, which is fatal
    /// for the session; every other non-2xx is an ordinary transfer failure.
    fn status_error(status: u16, body: String) -> SyncError {
        match status {
            401 | 403 => SyncError::AccessRevoked,
            _ => SyncError::Transfer { status, body },
        }
    }

    /// Fetch the full encoded document state from the store.
    pub async fn fetch_document(&self, project_id: &str) -> Result<Vec<u8>, SyncError> {
        let url = format!("{}/projects/{}/yjs-document", self.base_url, project_id);
        let resp = self.bearer(self.client.get(&url)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::status_error(status, body));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Save the full encoded document state to the store.
    pub async fn save_document(&self, project_id: &str, snapshot: Vec<u8>) -> Result<(), SyncError> {
        let url = format!("{}/projects/{}/yjs-document", self.base_url, project_id);
        let resp = self
            .bearer(self.client.post(&url))
            .header("Content-Type", "application/octet-stream")
            .body(snapshot)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            error!("Document save for '{}' failed with {}: {}", project_id, status, body);
            return Err(Self::status_error(status, body));
        }
        info!("Document '{}' saved to store", project_id);
        Ok(())
    }

    /// Degraded save for the unload path: fire the request from a detached
    /// task and never wait for the response, so teardown is not delayed.
    pub fn save_document_beacon(self: &Arc<Self>, project_id: &str, snapshot: Vec<u8>) {
        let this = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.save_document(&project_id, snapshot).await {
                debug!("Beacon save for '{}' was lost: {}", project_id, e);
            }
        });
    }

    /// List asset metadata for a project. Blobs are not transferred here.
    pub async fn list_assets(&self, project_id: &str) -> Result<Vec<StoreAssetMeta>, SyncError> {
        let url = format!("{}/projects/{}/assets", self.base_url, project_id);
        let resp = self.bearer(self.client.get(&url)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::status_error(status, body));
        }
        Ok(resp.json().await?)
    }

    /// Download one asset blob. Metadata travels in response headers, not the body.
    pub async fn download_asset(
        &self,
        project_id: &str,
        asset_id: Uuid,
    ) -> Result<(Vec<u8>, AssetRecord), SyncError> {
        let url = format!(
            "{}/projects/{}/assets/by-client-id/{}",
            self.base_url, project_id, asset_id
        );
        self.download_from(&url, asset_id).await
    }

    /// Download an asset blob from an explicit location (asset-ready messages
    /// carry a full download URL).
    pub async fn download_from(
        &self,
        url: &str,
        asset_id: Uuid,
    ) -> Result<(Vec<u8>, AssetRecord), SyncError> {
        let resp = self.bearer(self.client.get(url)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            error!("Asset '{}' download failed with {}: {}", asset_id, status, body);
            return Err(Self::status_error(status, body));
        }
        let record = record_from_headers(asset_id, resp.headers());
        let bytes = resp.bytes().await?.to_vec();
        let record = AssetRecord {
            size: if record.size > 0 { record.size } else { bytes.len() as u64 },
            ..record
        };
        Ok((bytes, record))
    }

    /// Upload one asset blob to a server-provided URL as multipart form
    /// field `file`. Non-2xx responses surface status and body.
    pub async fn upload_blob(
        &self,
        upload_url: &str,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<u64, SyncError> {
        let size = bytes.len() as u64;
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| SyncError::Config(format!("invalid mime '{}': {}", mime, e)))?;
        let form = Form::new().part("file", part);

        let resp = self
            .bearer(self.client.post(upload_url))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            error!("Asset upload to '{}' failed with {}: {}", upload_url, status, body);
            return Err(Self::status_error(status, body));
        }
        Ok(size)
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn record_from_headers(asset_id: Uuid, headers: &HeaderMap) -> AssetRecord {
    AssetRecord {
        id: asset_id,
        mime: header_str(headers, "X-Original-Mime")
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        filename: header_str(headers, "X-Filename").unwrap_or_else(|| asset_id.to_string()),
        folder_path: header_str(headers, "X-Folder-Path").unwrap_or_default(),
        size: header_str(headers, "X-File-Size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        hash: header_str(headers, "X-Asset-Hash"),
        has_local_blob: true,
        uploaded_to_store: true,
    }
}
