//! Fetch/patch orchestration backend: retrieves remotely hosted file bundles
//! by integer identifier, applies them onto a target tree with reversible
//! backups, and tracks per-task progress for non-blocking polling.

pub mod config;
pub mod entitlement;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use config::Environment;
pub use entitlement::{AllowAll, DenialCode, EntitlementGate, Feature};
pub use errors::{ForgeError, Result};

use services::{ApiClient, Extractor, Orchestrator, UpdateLoop, UpdateService};

/// The assembled backend, owned by the host runtime for its lifetime.
pub struct Backend {
    pub api: ApiClient,
    pub orchestrator: Orchestrator,
    pub updates: UpdateService,
    update_loop: Mutex<Option<UpdateLoop>>,
}

impl Backend {
    pub fn new(env: Environment, entitlements: Arc<dyn EntitlementGate>) -> Self {
        Self::with_api_base(env, entitlements, config::DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        env: Environment,
        entitlements: Arc<dyn EntitlementGate>,
        api_base: &str,
    ) -> Self {
        let api = ApiClient::new(api_base);
        let extractor = Arc::new(Extractor::new());
        let orchestrator = Orchestrator::new(api.clone(), env.clone(), entitlements, extractor.clone());
        let updates = UpdateService::new(api.clone(), env, extractor);
        Self {
            api,
            orchestrator,
            updates,
            update_loop: Mutex::new(None),
        }
    }

    /// Host startup hook: finish any staged self-update first, then start
    /// the periodic remote checks.
    pub async fn startup(&self) {
        self.updates.apply_pending_at_startup();

        let mut slot = self.update_loop.lock().await;
        if slot.is_none() {
            *slot = Some(self.updates.spawn_periodic(config::UPDATE_CHECK_INTERVAL));
        }
        drop(slot);

        // One-shot background passes; their results surface through the
        // availability notifications and the game ledger.
        let availability = self.orchestrator.availability().clone();
        tokio::spawn(async move {
            if let Err(err) = availability.check_now().await {
                tracing::warn!("availability check failed: {err}");
            }
        });
        let updates = self.updates.clone();
        tokio::spawn(async move {
            if let Err(err) = updates.check_game_updates_once().await {
                tracing::warn!("game update pass failed: {err}");
            }
        });
    }

    /// Host shutdown hook; bounded, never hangs on the background loop.
    pub async fn shutdown(&self) {
        let handle = self.update_loop.lock().await.take();
        if let Some(update_loop) = handle {
            update_loop.shutdown().await;
        }
    }
}
