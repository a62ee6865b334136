//! One background worker per (identifier, task kind), wired through the
//! fetcher, the extraction chain, and the patch engine, with every
//! transition mirrored into the family's task store for polling.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::config::Environment;
use crate::entitlement::{EntitlementGate, Feature};
use crate::errors::{ForgeError, Result};
use crate::models::BundleKind;
use crate::services::api_client::ApiClient;
use crate::services::availability::AvailabilityWatcher;
use crate::services::bundle_fetcher::BundleFetcher;
use crate::services::extraction::Extractor;
use crate::services::ledger::{Ledger, PendingGames};
use crate::services::patch_manager::{PatchFamily, PatchManager};
use crate::services::payload;
use crate::services::task_store::{
    CancelProbe, TaskFamily, TaskKey, TaskKind, TaskState, TaskStatus, TaskStore, TaskStores,
    TaskUpdate,
};
use crate::utils::file::write_json;

/// Free-text fragments that mark a failure as session/entitlement shaped.
/// The transport offers no structured code for server-side errors, so this
/// substring heuristic decides whether an availability request makes sense.
const SESSION_ERROR_KEYWORDS: &[&str] = &[
    "session",
    "license",
    "limit",
    "access denied",
    "forbidden",
    "feature disabled",
    "upgrade",
    "expired",
    "revoked",
    "token",
];

fn is_session_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SESSION_ERROR_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

struct OrchestratorInner {
    api: ApiClient,
    env: Environment,
    fetcher: BundleFetcher,
    extractor: Arc<Extractor>,
    patches: PatchManager,
    stores: TaskStores,
    entitlements: Arc<dyn EntitlementGate>,
    ledger: Ledger,
    pending: PendingGames,
    availability: AvailabilityWatcher,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        api: ApiClient,
        env: Environment,
        entitlements: Arc<dyn EntitlementGate>,
        extractor: Arc<Extractor>,
    ) -> Self {
        let fetcher = BundleFetcher::new(api.clone(), env.clone());
        let ledger = Ledger::new(env.clone());
        // Loaded at construction: the queue file is read and cleared before
        // any caller can observe entries from a prior session.
        let pending = PendingGames::load(&env);
        let availability = AvailabilityWatcher::new(api.clone(), env.clone());
        Self {
            inner: Arc::new(OrchestratorInner {
                api,
                env,
                fetcher,
                extractor,
                patches: PatchManager::new(),
                stores: TaskStores::new(),
                entitlements,
                ledger,
                pending,
                availability,
            }),
        }
    }

    pub fn stores(&self) -> &TaskStores {
        &self.inner.stores
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn pending_games(&self) -> &PendingGames {
        &self.inner.pending
    }

    pub fn availability(&self) -> &AvailabilityWatcher {
        &self.inner.availability
    }

    pub fn poll(&self, kind: TaskKind, app_id: u32) -> Option<TaskState> {
        self.inner
            .stores
            .for_kind(kind)
            .snapshot(TaskKey::new(app_id, kind))
    }

    /// Cooperative cancel; a no-op (still "accepted") once the task is
    /// terminal. The worker observes the flag at its next checkpoint.
    pub fn cancel(&self, kind: TaskKind, app_id: u32) -> bool {
        let cancelled = self
            .inner
            .stores
            .for_kind(kind)
            .request_cancel(TaskKey::new(app_id, kind));
        if cancelled {
            tracing::info!("cancellation requested for {app_id} ({kind:?})");
        }
        cancelled
    }

    pub fn list_active(&self, family: TaskFamily) -> Vec<(TaskKey, TaskState)> {
        self.inner.stores.family(family).active()
    }

    fn begin(&self, key: TaskKey, feature: Feature) -> Result<TaskStore> {
        let store = self.inner.stores.for_kind(key.kind).clone();
        if !store.try_begin(key) {
            return Err(ForgeError::Busy(format!(
                "a task is already running for {}",
                key.app_id
            )));
        }
        if let Err(code) = self.inner.entitlements.authorize(feature) {
            store.record_rejection(key, code.message());
            return Err(ForgeError::Entitlement(code));
        }
        Ok(store)
    }

    /// Queue a full-package fetch. Rejection reasons come back synchronously;
    /// everything after that is observed through `poll`.
    pub fn start_fetch(&self, app_id: u32) -> Result<()> {
        let key = TaskKey::new(app_id, TaskKind::Fetch);
        self.begin(key, Feature::Fetch)?;
        tracing::info!("queued fetch for {app_id}");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_fetch(inner, app_id).await;
        });
        Ok(())
    }

    pub fn start_fix(&self, app_id: u32, install_path: &Path, game_name: Option<String>) -> Result<()> {
        self.start_patch_apply(app_id, TaskKind::Fix, install_path, game_name)
    }

    pub fn start_bypass(&self, app_id: u32, install_path: &Path) -> Result<()> {
        self.start_patch_apply(app_id, TaskKind::BypassApply, install_path, None)
    }

    fn start_patch_apply(
        &self,
        app_id: u32,
        kind: TaskKind,
        install_path: &Path,
        game_name: Option<String>,
    ) -> Result<()> {
        if !install_path.is_dir() {
            return Err(ForgeError::Config("Install path not found".to_string()));
        }
        let feature = match kind {
            TaskKind::BypassApply => Feature::Bypass,
            _ => Feature::Fix,
        };
        let key = TaskKey::new(app_id, kind);
        self.begin(key, feature)?;
        tracing::info!("queued {kind:?} for {app_id}");

        let inner = self.inner.clone();
        let install_path = install_path.to_path_buf();
        tokio::spawn(async move {
            run_patch_apply(inner, app_id, kind, install_path, game_name).await;
        });
        Ok(())
    }

    pub fn start_unfix(&self, app_id: u32, install_path: &Path) -> Result<()> {
        self.start_patch_undo(app_id, TaskKind::Unfix, install_path)
    }

    pub fn start_bypass_removal(&self, app_id: u32, install_path: &Path) -> Result<()> {
        self.start_patch_undo(app_id, TaskKind::BypassRemove, install_path)
    }

    /// Removal tasks are local-only (no network round trip), so they skip
    /// the entitlement gate and go straight to a worker.
    fn start_patch_undo(&self, app_id: u32, kind: TaskKind, install_path: &Path) -> Result<()> {
        if !install_path.is_dir() {
            return Err(ForgeError::Config("Install path not found".to_string()));
        }
        let key = TaskKey::new(app_id, kind);
        let store = self.inner.stores.for_kind(kind).clone();
        if !store.try_begin(key) {
            return Err(ForgeError::Busy(format!(
                "a task is already running for {app_id}"
            )));
        }
        tracing::info!("queued {kind:?} for {app_id}");

        let inner = self.inner.clone();
        let install_path = install_path.to_path_buf();
        tokio::spawn(async move {
            run_patch_undo(inner, app_id, kind, install_path).await;
        });
        Ok(())
    }

    pub fn is_fix_applied(&self, install_path: &Path) -> bool {
        self.inner.patches.is_applied(PatchFamily::Fix, install_path)
    }

    pub fn is_bypass_applied(&self, install_path: &Path) -> bool {
        self.inner.patches.is_applied(PatchFamily::Bypass, install_path)
    }

    /// Remove every file a package fetch installed and drop the identifier
    /// from the ledger. Returns the paths actually deleted.
    pub fn delete_package(&self, app_id: u32) -> Vec<PathBuf> {
        let deleted = payload::delete_package_files(&self.inner.env, app_id);
        let name = self
            .inner
            .ledger
            .loaded_name(app_id)
            .unwrap_or_else(|| format!("Game {app_id}"));
        self.inner.ledger.remove_loaded(app_id);
        if !deleted.is_empty() {
            self.inner.ledger.log_event("REMOVED", app_id, &name);
        }
        deleted
    }
}

/// Catalog entry for an identifier from the saved bypass status file.
fn bypass_game_info(env: &Environment, app_id: u32) -> Option<serde_json::Value> {
    let catalog = crate::utils::file::read_json(&env.data_path(crate::config::BYPASS_STATUS_FILE))?;
    catalog.get(app_id.to_string()).cloned()
}

fn patch_kind_parts(kind: TaskKind) -> (PatchFamily, BundleKind, &'static str) {
    match kind {
        TaskKind::Fix | TaskKind::Unfix => (PatchFamily::Fix, BundleKind::Fix, "fix"),
        _ => (PatchFamily::Bypass, BundleKind::Bypass, "bypass"),
    }
}

async fn run_fetch(inner: Arc<OrchestratorInner>, app_id: u32) {
    let key = TaskKey::new(app_id, TaskKind::Fetch);
    let store = inner.stores.for_kind(TaskKind::Fetch).clone();
    let cancel = store.cancel_probe(key);
    let dest = inner.env.temp_download_dir().join(format!("{app_id}.zip"));

    store.merge(key, TaskUpdate::status(TaskStatus::Checking).clear_error());
    let outcome = fetch_and_install(&inner, app_id, &dest, &store, key, &cancel).await;

    match outcome {
        Ok(name) => {
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Done).with_result(json!({ "name": name })),
            );
            tracing::info!("fetch for {app_id} done");
        }
        Err(ForgeError::Cancelled) => {
            let _ = fs::remove_file(&dest);
            store.merge(key, TaskUpdate::status(TaskStatus::Cancelled));
            tracing::info!("fetch for {app_id} cancelled");
        }
        Err(err) => {
            let message = err.to_string();
            tracing::warn!("fetch for {app_id} failed: {message}");
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Failed).with_error(&message),
            );
            // Register interest so the caller hears about the bundle later,
            // unless the failure was the session's fault.
            if !is_session_error(&message) {
                inner.availability.record_request(app_id);
                if !inner.api.create_request(app_id).await {
                    tracing::warn!("remote availability request failed for {app_id}");
                }
            } else {
                tracing::debug!("skipping availability request for {app_id}: session error");
            }
        }
    }
}

async fn fetch_and_install(
    inner: &Arc<OrchestratorInner>,
    app_id: u32,
    dest: &Path,
    store: &TaskStore,
    key: TaskKey,
    cancel: &CancelProbe,
) -> Result<String> {
    let mut progress = {
        let store = store.clone();
        move |read: u64, total: u64| {
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Downloading).with_progress(read, total),
            );
        }
    };
    let archive = inner
        .fetcher
        .fetch(app_id, BundleKind::Package, dest, &mut progress, cancel)
        .await?;

    cancel.check()?;
    store.merge(key, TaskUpdate::status(TaskStatus::Extracting));
    let staging = inner
        .env
        .temp_download_dir()
        .join(format!("payload_{}_{}", app_id, Uuid::new_v4()));

    let outcome = async {
        inner.extractor.extract(&archive, &staging)?;

        cancel.check()?;
        store.merge(key, TaskUpdate::status(TaskStatus::Installing));
        payload::install_package(&inner.env, app_id, &staging, cancel)?;

        if let Some(metadata) = inner.api.fetch_metadata(app_id).await {
            let releases = inner.env.releases_dir();
            fs::create_dir_all(&releases)?;
            write_json(&releases.join(format!("{app_id}.json")), &metadata)?;
        }

        let name = match inner.api.fetch_app_name(app_id).await {
            Some(name) => name,
            None => format!("Game {app_id}"),
        };
        inner.ledger.append_loaded(app_id, &name);
        inner.ledger.log_event("ADDED", app_id, &name);
        inner.pending.push(app_id, &name);
        Ok(name)
    }
    .await;

    let _ = fs::remove_dir_all(&staging);
    let _ = fs::remove_file(dest);
    outcome
}

async fn run_patch_apply(
    inner: Arc<OrchestratorInner>,
    app_id: u32,
    kind: TaskKind,
    install_path: PathBuf,
    game_name: Option<String>,
) {
    let (family, bundle, tag) = patch_kind_parts(kind);
    let key = TaskKey::new(app_id, kind);
    let store = inner.stores.for_kind(kind).clone();
    let cancel = store.cancel_probe(key);

    store.merge(key, TaskUpdate::status(TaskStatus::Checking).clear_error());
    if inner.patches.is_applied(family, &install_path) {
        store.merge(
            key,
            TaskUpdate::status(TaskStatus::Failed)
                .with_error(ForgeError::AlreadyApplied.to_string()),
        );
        return;
    }

    let dest = inner
        .env
        .temp_download_dir()
        .join(format!("{tag}_{app_id}.zip"));
    let staging = inner
        .env
        .temp_download_dir()
        .join(format!("{tag}_extract_{}_{}", app_id, Uuid::new_v4()));
    let label = game_name.unwrap_or_else(|| format!("Game {app_id}"));

    // Bypass installs also refresh the compatibility catalog so the done
    // payload can carry the game's launcher info.
    if kind == TaskKind::BypassApply {
        match inner.api.fetch_bypass_status().await {
            Ok(status) => {
                if let Err(err) =
                    write_json(&inner.env.data_path(crate::config::BYPASS_STATUS_FILE), &status)
                {
                    tracing::warn!("failed to save bypass status catalog: {err}");
                }
            }
            Err(err) => tracing::warn!("bypass status refresh failed: {err}"),
        }
    }

    let outcome = async {
        let mut progress = {
            let store = store.clone();
            move |read: u64, total: u64| {
                store.merge(
                    key,
                    TaskUpdate::status(TaskStatus::Downloading).with_progress(read, total),
                );
            }
        };
        let archive = inner
            .fetcher
            .fetch(app_id, bundle, &dest, &mut progress, &cancel)
            .await?;

        cancel.check()?;
        store.merge(key, TaskUpdate::status(TaskStatus::Extracting));
        inner.extractor.extract(&archive, &staging)?;

        cancel.check()?;
        store.merge(key, TaskUpdate::status(TaskStatus::Installing));
        inner
            .patches
            .apply(app_id, family, &staging, &install_path, &label, &cancel)
            .await
    }
    .await;

    let _ = fs::remove_dir_all(&staging);
    let _ = fs::remove_file(&dest);

    match outcome {
        Ok(report) => {
            let mut result = serde_json::to_value(&report).unwrap_or(json!({}));
            if kind == TaskKind::BypassApply {
                if let Some(info) = bypass_game_info(&inner.env, app_id) {
                    result["game_info"] = info;
                }
            }
            store.merge(key, TaskUpdate::status(TaskStatus::Done).with_result(result));
            tracing::info!("{tag} applied for {app_id}");
        }
        Err(ForgeError::Cancelled) => {
            store.merge(key, TaskUpdate::status(TaskStatus::Cancelled));
            tracing::info!("{tag} apply for {app_id} cancelled");
        }
        Err(err) => {
            tracing::warn!("{tag} apply for {app_id} failed: {err}");
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Failed).with_error(err.to_string()),
            );
        }
    }
}

async fn run_patch_undo(
    inner: Arc<OrchestratorInner>,
    app_id: u32,
    kind: TaskKind,
    install_path: PathBuf,
) {
    let (family, _, tag) = patch_kind_parts(kind);
    let key = TaskKey::new(app_id, kind);
    let store = inner.stores.for_kind(kind).clone();

    store.merge(
        key,
        TaskUpdate::status(TaskStatus::Removing)
            .clear_error()
            .with_note("Reading manifest..."),
    );

    match inner.patches.undo(app_id, family, &install_path).await {
        Ok(report) => {
            let result = serde_json::to_value(&report).unwrap_or(json!({}));
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Done)
                    .with_note("Restored original files")
                    .with_result(result),
            );
            tracing::info!("{tag} removed for {app_id}");
        }
        Err(err) => {
            tracing::warn!("{tag} removal for {app_id} failed: {err}");
            store.merge(
                key,
                TaskUpdate::status(TaskStatus::Failed).with_error(err.to_string()),
            );
        }
    }
}
