//! Deferred availability requests: identifiers the user wanted but the
//! remote side did not have yet. Each request is a small JSON file; a batch
//! re-check promotes newly available identifiers into an in-memory
//! notification list drained by the UI.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::config::Environment;
use crate::errors::Result;
use crate::models::PendingGame;
use crate::services::api_client::ApiClient;

#[derive(Clone)]
pub struct AvailabilityWatcher {
    api: ApiClient,
    env: Environment,
    pending: Arc<Mutex<Vec<PendingGame>>>,
}

impl AvailabilityWatcher {
    pub fn new(api: ApiClient, env: Environment) -> Self {
        Self {
            api,
            env,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn request_path(&self, app_id: u32) -> PathBuf {
        self.env.requests_dir().join(format!("{app_id}.json"))
    }

    /// Record a local availability request. Returns false when the file
    /// cannot be written; the caller treats that as best-effort.
    pub fn record_request(&self, app_id: u32) -> bool {
        let dir = self.env.requests_dir();
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!("failed to create requests dir: {err}");
            return false;
        }
        let body = json!({ "appid": app_id }).to_string();
        match fs::write(self.request_path(app_id), body) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("failed to record request for {app_id}: {err}");
                false
            }
        }
    }

    pub fn requested_ids(&self) -> Vec<u32> {
        let dir = self.env.requests_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut ids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.trim_end_matches(".json")
                    .trim_end_matches(".txt")
                    .parse()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn clear_request(&self, app_id: u32) {
        let path = self.request_path(app_id);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    /// Batch-check every locally requested identifier; newly available ones
    /// are promoted to the notification list and their request files removed.
    pub async fn check_now(&self) -> Result<Vec<PendingGame>> {
        let requested = self.requested_ids();
        if requested.is_empty() {
            return Ok(self.pending_snapshot());
        }
        tracing::info!("checking availability for {} requested ids", requested.len());

        let available = self.api.check_exists_batch(&requested).await?;
        for app_id in available {
            let name = self
                .api
                .fetch_app_name(app_id)
                .await
                .unwrap_or_else(|| format!("Game {app_id}"));
            let game = PendingGame { app_id, name };
            tracing::info!("requested game {} is now available", game.app_id);
            {
                let mut pending = self.pending.lock().expect("availability list poisoned");
                pending.push(game);
            }
            self.clear_request(app_id);
        }

        Ok(self.pending_snapshot())
    }

    fn pending_snapshot(&self) -> Vec<PendingGame> {
        self.pending
            .lock()
            .expect("availability list poisoned")
            .clone()
    }

    /// Hand pending notifications to the caller and clear them.
    pub fn drain_notifications(&self) -> Vec<PendingGame> {
        let mut pending = self.pending.lock().expect("availability list poisoned");
        std::mem::take(&mut *pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{temp_dir, StubResponse, StubServer};

    #[tokio::test]
    async fn request_files_round_trip() {
        let dir = temp_dir("avail-files");
        let env = Environment::new(dir.clone(), dir, None);
        let watcher = AvailabilityWatcher::new(ApiClient::new("http://127.0.0.1:9"), env);

        assert!(watcher.record_request(300));
        assert!(watcher.record_request(100));
        assert_eq!(watcher.requested_ids(), vec![100, 300]);
    }

    #[tokio::test]
    async fn newly_available_ids_become_notifications() {
        let server = StubServer::start(vec![
            (
                "/check-exists-batch".to_string(),
                StubResponse::ok(
                    "application/json",
                    br#"{"success":true,"available":[300]}"#.to_vec(),
                ),
            ),
            (
                "/api/appdetails".to_string(),
                StubResponse::ok(
                    "application/json",
                    br#"{"300":{"data":{"name":"Now Here"}}}"#.to_vec(),
                ),
            ),
        ]);
        let dir = temp_dir("avail-check");
        let env = Environment::new(dir.clone(), dir, None);
        let watcher = AvailabilityWatcher::new(
            ApiClient::with_storefront(server.base_url(), server.base_url()),
            env,
        );
        watcher.record_request(300);
        watcher.record_request(400);

        let pending = watcher.check_now().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "Now Here");
        // Satisfied request is gone, the unavailable one stays.
        assert_eq!(watcher.requested_ids(), vec![400]);

        assert_eq!(watcher.drain_notifications().len(), 1);
        assert!(watcher.drain_notifications().is_empty());
    }
}
