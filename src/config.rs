use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base URL of the bundle distribution API.
pub const DEFAULT_API_BASE: &str = "https://api.patchforge.app";

/// Public store-front used for display-name lookups.
pub const DEFAULT_STOREFRONT_BASE: &str = "https://store.steampowered.com";

pub const USER_AGENT: &str = "Patchforge/1.0";

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const LOADED_APPS_FILE: &str = "loaded_apps.txt";
pub const APP_EVENTS_FILE: &str = "app_events.log";
pub const PENDING_GAMES_FILE: &str = "pending_games.json";
pub const REQUESTS_DIR: &str = "requests";
pub const RELEASES_DIR: &str = "releases";
pub const TEMP_DOWNLOAD_DIR: &str = "temp_dl";
pub const BYPASS_STATUS_FILE: &str = "bypass_status.json";
pub const UPDATE_PENDING_ZIP: &str = "update_pending.zip";
pub const UPDATE_PENDING_INFO: &str = "update_pending.json";
pub const RELEASE_INFO_FILE: &str = "release.json";

const ADDON_SCRIPT_SUBDIR: &str = "config/stplug-in";
const DEPOT_CACHE_SUBDIR: &str = "depotcache";

/// Filesystem roots handed to the backend by the host runtime.
///
/// `data_dir` holds everything the backend persists for itself (ledgers,
/// staged updates, scratch downloads). `install_dir` is the directory the
/// self-update unpacks over. `steam_root` is where full-package payloads are
/// installed; it is optional because the host may fail to locate it.
#[derive(Clone, Debug)]
pub struct Environment {
    data_dir: PathBuf,
    install_dir: PathBuf,
    steam_root: Option<PathBuf>,
}

impl Environment {
    pub fn new(data_dir: PathBuf, install_dir: PathBuf, steam_root: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            install_dir,
            steam_root,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn steam_root(&self) -> Option<&Path> {
        self.steam_root.as_deref()
    }

    pub fn data_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Scratch directory for in-flight downloads. Created on demand.
    pub fn temp_download_dir(&self) -> PathBuf {
        let dir = self.data_dir.join(TEMP_DOWNLOAD_DIR);
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!("failed to create scratch dir {}: {err}", dir.display());
        }
        dir
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.data_dir.join(REQUESTS_DIR)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.data_dir.join(RELEASES_DIR)
    }

    pub fn addon_script_dir(&self) -> Option<PathBuf> {
        self.steam_root.as_ref().map(|root| root.join(ADDON_SCRIPT_SUBDIR))
    }

    pub fn depot_cache_dir(&self) -> Option<PathBuf> {
        self.steam_root.as_ref().map(|root| root.join(DEPOT_CACHE_SUBDIR))
    }

    /// Locally recorded version of this installation, read from
    /// `release.json` next to the installed files. Missing or malformed
    /// metadata reads as version "0" so any remote release wins.
    pub fn current_version(&self) -> String {
        let path = self.install_dir.join(RELEASE_INFO_FILE);
        crate::utils::file::read_json(&path)
            .and_then(|value| value.get("version").and_then(|v| v.as_str()).map(String::from))
            .unwrap_or_else(|| "0".to_string())
    }
}
