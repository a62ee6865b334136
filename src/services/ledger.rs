//! Local bookkeeping: which identifiers are loaded, the append-only event
//! log, and the "pending games" queue surfaced to the UI after a restart.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::{self, Environment};
use crate::models::PendingGame;
use crate::utils::file::write_atomic;

/// `id:label` line file plus the event log. Every operation is best-effort:
/// ledger trouble is logged, never fatal to the task that triggered it.
#[derive(Clone)]
pub struct Ledger {
    env: Environment,
}

impl Ledger {
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    fn loaded_path(&self) -> PathBuf {
        self.env.data_path(config::LOADED_APPS_FILE)
    }

    fn events_path(&self) -> PathBuf {
        self.env.data_path(config::APP_EVENTS_FILE)
    }

    fn read_lines(&self) -> Vec<String> {
        fs::read_to_string(self.loaded_path())
            .map(|text| text.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    fn write_lines(&self, lines: &[String]) {
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        if let Err(err) = write_atomic(&self.loaded_path(), text.as_bytes()) {
            tracing::warn!("failed to write loaded-apps ledger: {err}");
        }
    }

    /// Record (or re-record) a loaded identifier with its display label.
    pub fn append_loaded(&self, app_id: u32, name: &str) {
        let prefix = format!("{app_id}:");
        let mut lines: Vec<String> = self
            .read_lines()
            .into_iter()
            .filter(|line| !line.starts_with(&prefix))
            .collect();
        lines.push(format!("{app_id}:{name}"));
        self.write_lines(&lines);
    }

    pub fn remove_loaded(&self, app_id: u32) {
        let prefix = format!("{app_id}:");
        let lines = self.read_lines();
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| !line.starts_with(&prefix))
            .cloned()
            .collect();
        if kept.len() != lines.len() {
            self.write_lines(&kept);
        }
    }

    pub fn loaded_name(&self, app_id: u32) -> Option<String> {
        let prefix = format!("{app_id}:");
        self.read_lines().into_iter().find_map(|line| {
            line.strip_prefix(&prefix)
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
    }

    pub fn loaded_apps(&self) -> Vec<crate::models::LoadedApp> {
        self.read_lines()
            .into_iter()
            .filter_map(|line| {
                let (id_text, name) = line.split_once(':')?;
                let app_id = id_text.trim().parse().ok()?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(crate::models::LoadedApp {
                    app_id,
                    name: name.to_string(),
                })
            })
            .collect()
    }

    pub fn dismiss_all(&self) {
        let path = self.loaded_path();
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!("failed to clear loaded-apps ledger: {err}");
            }
        }
    }

    /// Append an `[ADDED]` / `[REMOVED]` line to the event log.
    pub fn log_event(&self, action: &str, app_id: u32, name: &str) {
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{action}] {app_id} - {name} - {stamp}\n");
        let path = self.events_path();
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                use std::io::Write;
                file.write_all(line.as_bytes())
            });
        if let Err(err) = result {
            tracing::warn!("failed to append event log: {err}");
        }
    }
}

/// Queue of newly fetched games to announce after the next restart.
///
/// The file is read and cleared exactly once, at construction, before any
/// caller can observe stale entries from a prior session; entries pushed
/// afterwards land back in the file for the following session.
pub struct PendingGames {
    path: PathBuf,
    startup: Mutex<Vec<PendingGame>>,
}

impl PendingGames {
    pub fn load(env: &Environment) -> Self {
        let path = env.data_path(config::PENDING_GAMES_FILE);
        let startup = read_pending(&path);
        if !startup.is_empty() {
            if let Err(err) = write_atomic(&path, b"[]") {
                tracing::warn!("failed to clear pending-games queue: {err}");
            }
        }
        Self {
            path,
            startup: Mutex::new(startup),
        }
    }

    /// Games that were queued when this session started. Drains once.
    pub fn take_startup(&self) -> Vec<PendingGame> {
        let mut startup = self.startup.lock().expect("pending games poisoned");
        std::mem::take(&mut *startup)
    }

    /// Queue a game for the next session. Duplicate identifiers are ignored.
    pub fn push(&self, app_id: u32, name: &str) {
        let mut entries = read_pending(&self.path);
        if entries.iter().any(|entry| entry.app_id == app_id) {
            return;
        }
        entries.push(PendingGame {
            app_id,
            name: name.to_string(),
        });
        match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => {
                if let Err(err) = write_atomic(&self.path, &bytes) {
                    tracing::warn!("failed to write pending-games queue: {err}");
                }
            }
            Err(err) => tracing::warn!("failed to serialize pending-games queue: {err}"),
        }
    }
}

fn read_pending(path: &PathBuf) -> Vec<PendingGame> {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    fn env(tag: &str) -> Environment {
        let dir = temp_dir(tag);
        Environment::new(dir.clone(), dir, None)
    }

    #[test]
    fn loaded_apps_round_trip_and_replace() {
        let ledger = Ledger::new(env("ledger-roundtrip"));
        ledger.append_loaded(10, "First");
        ledger.append_loaded(20, "Second: With Colon");
        ledger.append_loaded(10, "Renamed");

        let apps = ledger.loaded_apps();
        assert_eq!(apps.len(), 2);
        assert_eq!(ledger.loaded_name(10).as_deref(), Some("Renamed"));
        assert_eq!(ledger.loaded_name(20).as_deref(), Some("Second: With Colon"));

        ledger.remove_loaded(10);
        assert!(ledger.loaded_name(10).is_none());
        assert_eq!(ledger.loaded_apps().len(), 1);
    }

    #[test]
    fn dismiss_clears_everything() {
        let ledger = Ledger::new(env("ledger-dismiss"));
        ledger.append_loaded(1, "A");
        ledger.dismiss_all();
        assert!(ledger.loaded_apps().is_empty());
    }

    #[test]
    fn pending_games_drain_once_at_startup() {
        let environment = env("pending-startup");
        {
            let queue = PendingGames::load(&environment);
            queue.push(1, "One");
            queue.push(2, "Two");
            queue.push(1, "One Again");
        }

        // Next session: startup snapshot carries the queued games...
        let queue = PendingGames::load(&environment);
        let games = queue.take_startup();
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].name, "One");

        // ...exactly once, and the file is already cleared for the session
        // after this one.
        assert!(queue.take_startup().is_empty());
        let queue_next = PendingGames::load(&environment);
        assert!(queue_next.take_startup().is_empty());
    }
}
