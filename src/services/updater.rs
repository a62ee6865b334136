//! Self-update staging and the per-game update pass.
//!
//! A newer remote release is downloaded to a fixed staging path with a JSON
//! sidecar and applied unpacked at the next startup; nothing is hot-swapped.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{self, Environment};
use crate::errors::{ForgeError, Result};
use crate::models::{BundleKind, ReleaseInfo};
use crate::services::api_client::ApiClient;
use crate::services::bundle_fetcher::BundleFetcher;
use crate::services::extraction::Extractor;
use crate::services::payload;
use crate::services::task_store::CancelProbe;
use crate::utils::file::write_atomic;

/// All decimal runs of a version string, in order. Non-numeric fragments are
/// ignored, so `"v1.2.3-beta"` compares as `[1, 2, 3]`.
pub fn parse_version(version: &str) -> Vec<u64> {
    let mut parts = Vec::new();
    let mut current: Option<u64> = None;
    for ch in version.chars() {
        if let Some(digit) = ch.to_digit(10) {
            current = Some(current.unwrap_or(0).saturating_mul(10) + digit as u64);
        } else if let Some(value) = current.take() {
            parts.push(value);
        }
    }
    if let Some(value) = current {
        parts.push(value);
    }
    if parts.is_empty() {
        parts.push(0);
    }
    parts
}

pub fn is_newer(remote: &str, local: &str) -> bool {
    parse_version(remote) > parse_version(local)
}

#[derive(Clone)]
pub struct UpdateService {
    api: ApiClient,
    env: Environment,
    fetcher: BundleFetcher,
    extractor: Arc<Extractor>,
    restart_required: Arc<AtomicBool>,
}

impl UpdateService {
    pub fn new(api: ApiClient, env: Environment, extractor: Arc<Extractor>) -> Self {
        let fetcher = BundleFetcher::new(api.clone(), env.clone());
        Self {
            api,
            env,
            fetcher,
            extractor,
            restart_required: Arc::new(AtomicBool::new(false)),
        }
    }

    fn pending_zip_path(&self) -> PathBuf {
        self.env.data_path(config::UPDATE_PENDING_ZIP)
    }

    fn pending_info_path(&self) -> PathBuf {
        self.env.data_path(config::UPDATE_PENDING_INFO)
    }

    pub fn restart_required(&self) -> bool {
        self.restart_required.load(Ordering::SeqCst)
    }

    /// Unpack a previously staged update over the installation root.
    ///
    /// Runs before anything else at startup. Per-file write failures are
    /// logged and skipped, and the staging files are deleted whatever
    /// happens, so a broken archive cannot wedge every subsequent start.
    pub fn apply_pending_at_startup(&self) {
        let zip_path = self.pending_zip_path();
        if !zip_path.exists() {
            return;
        }
        tracing::info!("applying staged update from {}", zip_path.display());

        if let Err(err) = self.unpack_staged(&zip_path) {
            tracing::warn!("staged update could not be applied: {err}");
        }

        let _ = fs::remove_file(&zip_path);
        let _ = fs::remove_file(self.pending_info_path());
    }

    fn unpack_staged(&self, zip_path: &Path) -> Result<()> {
        let file = fs::File::open(zip_path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|err| ForgeError::Archive(err.to_string()))?;

        let mut entries: Vec<PathBuf> = Vec::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|err| ForgeError::Archive(err.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            if let Some(path) = entry.enclosed_name().map(|p| p.to_path_buf()) {
                entries.push(path);
            }
        }
        let wrapper = common_wrapper_root(&entries);

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|err| ForgeError::Archive(err.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let Some(raw) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };
            let Some(relative) = strip_wrapper(&raw, wrapper.as_deref()) else {
                continue;
            };
            if has_vcs_component(&relative) {
                continue;
            }

            let target = self.env.install_dir().join(&relative);
            let mut write = || -> io::Result<()> {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = fs::File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                Ok(())
            };
            if let Err(err) = write() {
                tracing::warn!("failed to update {}: {err}", relative.display());
            }
        }
        Ok(())
    }

    /// Probe the remote release; `Some` only when it is strictly newer than
    /// the locally recorded version.
    pub async fn check_remote(&self) -> Result<Option<ReleaseInfo>> {
        let local = self.env.current_version();
        let Some(info) = self.api.latest_release().await? else {
            return Ok(None);
        };
        if is_newer(&info.version, &local) {
            tracing::info!("update available: {local} -> {}", info.version);
            Ok(Some(info))
        } else {
            tracing::debug!("no update needed, remote {} local {local}", info.version);
            Ok(None)
        }
    }

    /// Download the release archive to the staging path, write the sidecar
    /// metadata, and mark a restart as required.
    pub async fn stage(&self, info: &ReleaseInfo) -> Result<()> {
        let asset = info
            .assets
            .iter()
            .find(|asset| {
                let name = asset.name.to_ascii_lowercase();
                name.ends_with(".zip") && name.contains("patchforge")
            })
            .or_else(|| info.assets.first())
            .ok_or_else(|| ForgeError::Config("release carries no assets".to_string()))?;
        let endpoint = asset
            .download_endpoint
            .as_deref()
            .ok_or_else(|| ForgeError::Config("release asset has no download endpoint".to_string()))?;

        self.api
            .download_release_asset(endpoint, &self.pending_zip_path())
            .await?;
        write_atomic(&self.pending_info_path(), &serde_json::to_vec(info)?)?;
        self.restart_required.store(true, Ordering::SeqCst);
        tracing::info!("staged update {}", info.version);
        Ok(())
    }

    /// One probe-and-stage pass; returns the staged version, if any.
    pub async fn check_and_stage(&self) -> Result<Option<String>> {
        match self.check_remote().await? {
            Some(info) => {
                self.stage(&info).await?;
                Ok(Some(info.version))
            }
            None => Ok(None),
        }
    }

    /// Batch-check every locally recorded game release and re-install the
    /// ones the server says are stale. Per-game failures are logged and do
    /// not stop the pass. Returns how many games were refreshed.
    pub async fn check_game_updates_once(&self) -> Result<u32> {
        let local = self.local_game_releases();
        if local.is_empty() {
            tracing::debug!("no local game releases to check");
            return Ok(0);
        }

        let payload: HashMap<String, String> = local
            .iter()
            .map(|(app_id, version)| (app_id.to_string(), version.clone()))
            .collect();
        let updates = self.api.check_updates_batch(&payload).await?;
        tracing::info!("batch check found {} stale games", updates.len());

        let mut refreshed = 0u32;
        for entry in updates {
            match self.refresh_game(entry.appid).await {
                Ok(()) => refreshed += 1,
                Err(err) => tracing::warn!("failed to refresh game {}: {err}", entry.appid),
            }
        }
        Ok(refreshed)
    }

    fn local_game_releases(&self) -> Vec<(u32, String)> {
        let dir = self.env.releases_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let app_id: u32 = name.strip_suffix(".json")?.parse().ok()?;
                let value = crate::utils::file::read_json(&entry.path())?;
                let version = value
                    .get("release")
                    .or_else(|| value.get("version"))
                    .map(|v| match v.as_str() {
                        Some(text) => text.to_string(),
                        None => v.to_string(),
                    })
                    .unwrap_or_else(|| "0".to_string());
                Some((app_id, version))
            })
            .collect()
    }

    async fn refresh_game(&self, app_id: u32) -> Result<()> {
        let scratch = self.env.temp_download_dir();
        let archive_path = scratch.join(format!("{app_id}_update.zip"));
        let extract_dir = scratch.join(format!("update_extract_{}_{}", app_id, Uuid::new_v4()));

        let outcome = async {
            let mut sink = |_read: u64, _total: u64| {};
            let archive = self
                .fetcher
                .fetch(app_id, BundleKind::Package, &archive_path, &mut sink, &CancelProbe::never())
                .await?;
            self.extractor.extract(&archive, &extract_dir)?;
            payload::install_package(&self.env, app_id, &extract_dir, &CancelProbe::never())?;

            if let Some(metadata) = self.api.fetch_metadata(app_id).await {
                let dir = self.env.releases_dir();
                fs::create_dir_all(&dir)?;
                crate::utils::file::write_json(&dir.join(format!("{app_id}.json")), &metadata)?;
            }
            tracing::info!("refreshed game {app_id}");
            Ok(())
        }
        .await;

        let _ = fs::remove_file(&archive_path);
        let _ = fs::remove_dir_all(&extract_dir);
        outcome
    }

    /// Re-run the remote update check on a fixed interval until stopped.
    pub fn spawn_periodic(&self, interval: Duration) -> UpdateLoop {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let service = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match service.check_and_stage().await {
                    Ok(Some(version)) => tracing::info!("background check staged {version}"),
                    Ok(None) => {}
                    Err(err) => tracing::warn!("background update check failed: {err}"),
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        UpdateLoop {
            stop: stop_tx,
            handle,
        }
    }
}

/// Handle for the periodic check; shutdown joins with a bounded timeout so
/// the host never hangs on exit.
pub struct UpdateLoop {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl UpdateLoop {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(config::SHUTDOWN_JOIN_TIMEOUT, self.handle)
            .await
            .is_err()
        {
            tracing::warn!("update loop did not stop within the join timeout");
        }
    }
}

/// The single top-level directory shared by every entry, if there is one and
/// every entry sits below it.
fn common_wrapper_root(entries: &[PathBuf]) -> Option<std::ffi::OsString> {
    let mut shared: Option<std::ffi::OsString> = None;
    for entry in entries {
        let mut components = entry.components().filter_map(|component| match component {
            Component::Normal(segment) => Some(segment),
            _ => None,
        });
        let first = components.next()?.to_os_string();
        if components.next().is_none() {
            // A top-level file: there is no wrapper to strip.
            return None;
        }
        match &shared {
            None => shared = Some(first),
            Some(current) if *current == first => {}
            Some(_) => return None,
        }
    }
    shared
}

fn strip_wrapper(path: &Path, wrapper: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let mut components = path.components().filter_map(|component| match component {
        Component::Normal(segment) => Some(segment),
        _ => None,
    });
    let mut out = PathBuf::new();
    if let Some(wrapper) = wrapper {
        let first = components.next()?;
        if first != wrapper {
            out.push(first);
        }
    }
    for segment in components {
        out.push(segment);
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn has_vcs_component(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(segment) => {
            let lower = segment.to_string_lossy().to_ascii_lowercase();
            lower == ".git" || lower.starts_with(".git")
        }
        _ => false,
    })
}
