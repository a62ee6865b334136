use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use futures_util::StreamExt;
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config;
use crate::errors::{ForgeError, Result};
use crate::models::{
    ArchiveDescriptor, BatchAvailabilityResponse, BatchUpdatesResponse, BundleKind, ProbeResponse,
    ReleaseInfo, UpdateEntry,
};
use crate::services::task_store::CancelProbe;

pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// HTTP client for the bundle distribution API.
///
/// Two underlying clients: short timeouts for JSON calls, a long allowance
/// for streamed archive bodies.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    download_client: reqwest::Client,
    base_url: String,
    storefront_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_storefront(base_url, config::DEFAULT_STOREFRONT_BASE)
    }

    pub fn with_storefront(base_url: impl Into<String>, storefront_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(config::USER_AGENT)
            .timeout(config::HTTP_TIMEOUT)
            .connect_timeout(config::HTTP_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let download_client = reqwest::Client::builder()
            .user_agent(config::USER_AGENT)
            .timeout(config::DOWNLOAD_TIMEOUT)
            .connect_timeout(config::HTTP_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            download_client,
            base_url: base_url.into(),
            storefront_url: storefront_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    /// Probe the shape of a remote bundle. `Ok(None)` means the bundle does
    /// not exist, which callers must treat as "not available", not failure.
    pub async fn probe(&self, app_id: u32, kind: BundleKind) -> Result<Option<ArchiveDescriptor>> {
        let path = format!("{}/{}/info", kind.path_segment(), app_id);
        let probe: ProbeResponse = self.get_json(&path).await?;
        probe.into_descriptor()
    }

    /// Stream a single-file bundle to `dest`, reporting `(read, total)` after
    /// every chunk. No destination file is left behind on failure.
    pub async fn download_bundle(
        &self,
        app_id: u32,
        kind: BundleKind,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelProbe,
    ) -> Result<u64> {
        let url = self.url(&format!("{}/{}", kind.path_segment(), app_id));
        let response = self
            .open_download(&url, kind.not_available_message())
            .await?;
        stream_to_file(response, dest, progress, cancel).await
    }

    /// Download one part of a split archive. Returns the part's size.
    pub async fn download_part(
        &self,
        app_id: u32,
        kind: BundleKind,
        filename: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelProbe,
    ) -> Result<u64> {
        let url = self.url(&format!(
            "{}/{}/part/{}",
            kind.path_segment(),
            app_id,
            filename
        ));
        let not_found = format!("Part file {filename} not found");
        let response = self
            .open_download(&url, &not_found)
            .await
            .map_err(|err| match err {
                // A missing part mid-download is a hard failure, not
                // bundle-level unavailability.
                ForgeError::NotAvailable(msg) => ForgeError::Remote(msg),
                other => other,
            })?;
        let written = stream_to_file(response, dest, progress, cancel).await?;
        if written == 0 {
            let _ = fs::remove_file(dest);
            return Err(ForgeError::Remote(format!(
                "Downloaded part {filename} is empty"
            )));
        }
        Ok(written)
    }

    async fn open_download(&self, url: &str, not_found_message: &str) -> Result<Response> {
        let response = self.download_client.get(url).send().await?;
        let status = response.status();

        if status.as_u16() == 404 {
            let message = remote_error_text(response)
                .await
                .unwrap_or_else(|| not_found_message.to_string());
            return Err(ForgeError::NotAvailable(message));
        }
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        // A JSON body on a 2xx download response is an API error payload,
        // never archive data.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if content_type.contains("application/json") {
            let message = remote_error_text(response)
                .await
                .unwrap_or_else(|| "Server returned JSON instead of archive data".to_string());
            return Err(ForgeError::Remote(message));
        }

        Ok(response)
    }

    /// The bypass status catalog: per-identifier launcher/compatibility info.
    pub async fn fetch_bypass_status(&self) -> Result<Value> {
        self.get_json("bypass/status").await
    }

    /// Game metadata JSON for an identifier. Best-effort: absent or failing
    /// metadata is `None`, never an error.
    pub async fn fetch_metadata(&self, app_id: u32) -> Option<Value> {
        match self.get_json::<Value>(&format!("json/{app_id}")).await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("metadata fetch failed for {app_id}: {err}");
                None
            }
        }
    }

    /// Register interest in a bundle that is not available yet.
    pub async fn create_request(&self, app_id: u32) -> bool {
        let result = self
            .client
            .put(self.url(&format!("request/{app_id}")))
            .send()
            .await;
        match result {
            Ok(response) => matches!(response.status().as_u16(), 200 | 201),
            Err(err) => {
                tracing::warn!("create_request failed for {app_id}: {err}");
                false
            }
        }
    }

    pub async fn check_exists_batch(&self, app_ids: &[u32]) -> Result<Vec<u32>> {
        let payload = json!({ "appids": app_ids });
        let response: BatchAvailabilityResponse =
            self.post_json("check-exists-batch", &payload).await?;
        if response.success {
            Ok(response.available)
        } else {
            Err(ForgeError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "Batch availability check failed".to_string()),
            ))
        }
    }

    pub async fn check_updates_batch(
        &self,
        games: &HashMap<String, String>,
    ) -> Result<Vec<UpdateEntry>> {
        let payload = json!({ "games": games });
        let response: BatchUpdatesResponse = self.post_json("update/check-batch", &payload).await?;
        if response.success {
            Ok(response.updates)
        } else {
            Err(ForgeError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "Batch update check failed".to_string()),
            ))
        }
    }

    /// Latest self-update release, or `None` when the server has nothing to
    /// say (treated as "no update", not an error).
    pub async fn latest_release(&self) -> Result<Option<ReleaseInfo>> {
        let response = self.client.get(self.url("update/latest")).send().await?;
        if !response.status().is_success() {
            tracing::warn!("update check returned HTTP {}", response.status().as_u16());
            return Ok(None);
        }
        Ok(Some(response.json::<ReleaseInfo>().await?))
    }

    /// Stream a self-update asset to `dest`.
    pub async fn download_release_asset(&self, endpoint: &str, dest: &Path) -> Result<u64> {
        let url = self.url(endpoint);
        let response = self.open_download(&url, "Update asset not found").await?;
        let mut sink = |_read: u64, _total: u64| {};
        stream_to_file(response, dest, &mut sink, &CancelProbe::never()).await
    }

    /// Display name lookup via the public store-front. Best-effort.
    pub async fn fetch_app_name(&self, app_id: u32) -> Option<String> {
        let url = format!(
            "{}/api/appdetails?appids={}",
            self.storefront_url.trim_end_matches('/'),
            app_id
        );
        let value = self
            .client
            .get(&url)
            .send()
            .await
            .ok()?
            .json::<Value>()
            .await
            .ok()?;
        let name = value
            .get(app_id.to_string())?
            .get("data")?
            .get("name")?
            .as_str()?
            .trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

/// Pull the server's `{"error": ...}` text out of a response body, if any.
async fn remote_error_text(response: Response) -> Option<String> {
    let text = response.text().await.ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    value
        .get("error")
        .and_then(|v| v.as_str())
        .map(String::from)
}

async fn error_from_response(response: Response) -> ForgeError {
    let status = response.status().as_u16();
    match remote_error_text(response).await {
        Some(message) => ForgeError::Remote(message),
        None => ForgeError::Http(format!("Download failed with status {status}")),
    }
}

fn looks_like_json(chunk: &[u8]) -> bool {
    chunk
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .map(|byte| *byte == b'{' || *byte == b'[')
        .unwrap_or(false)
}

/// Stream a response body to disk with per-chunk progress and cancellation
/// checks. Deletes the partial file on any failure or cancellation.
async fn stream_to_file(
    response: Response,
    dest: &Path,
    progress: ProgressFn<'_>,
    cancel: &CancelProbe,
) -> Result<u64> {
    let total = response.content_length().unwrap_or(0);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(dest)?;
    let mut stream = response.bytes_stream();
    let mut read: u64 = 0;
    let mut first_chunk = true;

    let outcome: Result<u64> = async {
        while let Some(chunk) = stream.next().await {
            cancel.check()?;
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if first_chunk {
                first_chunk = false;
                // Content-type lied or was absent: a body that opens like a
                // JSON document is an error payload, not archive bytes.
                if looks_like_json(&chunk) {
                    let mut body = chunk.to_vec();
                    while let Some(more) = stream.next().await {
                        let more = more?;
                        body.extend_from_slice(&more);
                        if body.len() > 64 * 1024 {
                            break;
                        }
                    }
                    let message = serde_json::from_slice::<Value>(&body)
                        .ok()
                        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                        .unwrap_or_else(|| {
                            "Server returned JSON instead of archive data".to_string()
                        });
                    return Err(ForgeError::Remote(message));
                }
            }
            file.write_all(&chunk)?;
            read += chunk.len() as u64;
            progress(read, total);
        }
        file.flush()?;
        Ok(read)
    }
    .await;

    if outcome.is_err() {
        drop(file);
        let _ = fs::remove_file(dest);
    }
    outcome
}
