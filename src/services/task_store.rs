use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ForgeError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Fetch,
    Fix,
    Unfix,
    BypassApply,
    BypassRemove,
}

impl TaskKind {
    pub fn family(&self) -> TaskFamily {
        match self {
            TaskKind::Fetch => TaskFamily::Fetch,
            TaskKind::Fix | TaskKind::Unfix => TaskFamily::Fix,
            TaskKind::BypassApply => TaskFamily::Bypass,
            TaskKind::BypassRemove => TaskFamily::BypassRemoval,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFamily {
    Fetch,
    Fix,
    Bypass,
    BypassRemoval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TaskKey {
    pub app_id: u32,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn new(app_id: u32, kind: TaskKind) -> Self {
        Self { app_id, kind }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Checking,
    Downloading,
    Extracting,
    Installing,
    Removing,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Snapshot of one task. `total_bytes == 0` means "unknown", not empty.
#[derive(Clone, Debug, Serialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub note: Option<String>,
    pub result: Option<Value>,
}

impl TaskState {
    fn queued() -> Self {
        Self {
            status: TaskStatus::Queued,
            bytes_read: 0,
            total_bytes: 0,
            error: None,
            note: None,
            result: None,
        }
    }
}

/// Partial update merged into a task record. Absent fields keep their value.
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    status: Option<TaskStatus>,
    bytes_read: Option<u64>,
    total_bytes: Option<u64>,
    error: Option<String>,
    note: Option<String>,
    result: Option<Value>,
    clear_error: bool,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, bytes_read: u64, total_bytes: u64) -> Self {
        self.bytes_read = Some(bytes_read);
        self.total_bytes = Some(total_bytes);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }
}

/// Lock-protected record map for one task family.
///
/// Workers own the writes for their key; any thread may snapshot. Merges are
/// atomic under the mutex and a `Cancelled` status is never demoted by a
/// merge — only a fresh `try_begin` replaces a terminal record.
#[derive(Clone, Default)]
pub struct TaskStore {
    inner: Arc<Mutex<HashMap<TaskKey, TaskState>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new task if the key is free (absent or terminal). The previous
    /// record is overwritten, never enqueued behind.
    pub fn try_begin(&self, key: TaskKey) -> bool {
        let mut map = self.inner.lock().expect("task store poisoned");
        match map.get(&key) {
            Some(state) if !state.status.is_terminal() => false,
            _ => {
                map.insert(key, TaskState::queued());
                true
            }
        }
    }

    /// Record an up-front rejection (entitlement denial, bad arguments) as a
    /// terminal failed record without spawning a worker.
    pub fn record_rejection(&self, key: TaskKey, reason: &str) {
        let mut map = self.inner.lock().expect("task store poisoned");
        let mut state = TaskState::queued();
        state.status = TaskStatus::Failed;
        state.error = Some(reason.to_string());
        map.insert(key, state);
    }

    pub fn merge(&self, key: TaskKey, update: TaskUpdate) {
        let mut map = self.inner.lock().expect("task store poisoned");
        let state = map.entry(key).or_insert_with(TaskState::queued);
        if let Some(status) = update.status {
            if state.status != TaskStatus::Cancelled {
                state.status = status;
            }
        }
        if let Some(bytes) = update.bytes_read {
            state.bytes_read = bytes;
        }
        if let Some(total) = update.total_bytes {
            state.total_bytes = total;
        }
        if update.clear_error {
            state.error = None;
        }
        if let Some(error) = update.error {
            state.error = Some(error);
        }
        if let Some(note) = update.note {
            state.note = Some(note);
        }
        if let Some(result) = update.result {
            state.result = Some(result);
        }
    }

    pub fn snapshot(&self, key: TaskKey) -> Option<TaskState> {
        let map = self.inner.lock().expect("task store poisoned");
        map.get(&key).cloned()
    }

    /// Cooperative cancellation: flips a non-terminal record to `Cancelled`.
    /// Returns false (a no-op) when there is nothing to cancel.
    pub fn request_cancel(&self, key: TaskKey) -> bool {
        let mut map = self.inner.lock().expect("task store poisoned");
        match map.get_mut(&key) {
            Some(state) if !state.status.is_terminal() => {
                state.status = TaskStatus::Cancelled;
                state.error = Some("Cancelled by user".to_string());
                true
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self, key: TaskKey) -> bool {
        let map = self.inner.lock().expect("task store poisoned");
        map.get(&key)
            .map(|state| state.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    pub fn active(&self) -> Vec<(TaskKey, TaskState)> {
        let map = self.inner.lock().expect("task store poisoned");
        map.iter()
            .filter(|(_, state)| !state.status.is_terminal())
            .map(|(key, state)| (*key, state.clone()))
            .collect()
    }

    pub fn cancel_probe(&self, key: TaskKey) -> CancelProbe {
        CancelProbe {
            store: Some(self.clone()),
            key,
        }
    }
}

/// Handle a worker polls between coarse-grained steps; the flag is the task's
/// own status, so there is exactly one source of truth for "cancelled".
#[derive(Clone)]
pub struct CancelProbe {
    store: Option<TaskStore>,
    key: TaskKey,
}

impl CancelProbe {
    /// Probe that never fires, for flows with no owning task.
    pub fn never() -> Self {
        Self {
            store: None,
            key: TaskKey::new(0, TaskKind::Fetch),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.store
            .as_ref()
            .map(|store| store.is_cancelled(self.key))
            .unwrap_or(false)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ForgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One store per task family, so keys never collide across families and
/// `list active` stays family-scoped.
#[derive(Clone, Default)]
pub struct TaskStores {
    fetch: TaskStore,
    fix: TaskStore,
    bypass: TaskStore,
    bypass_removal: TaskStore,
}

impl TaskStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(&self, family: TaskFamily) -> &TaskStore {
        match family {
            TaskFamily::Fetch => &self.fetch,
            TaskFamily::Fix => &self.fix,
            TaskFamily::Bypass => &self.bypass,
            TaskFamily::BypassRemoval => &self.bypass_removal,
        }
    }

    pub fn for_kind(&self, kind: TaskKind) -> &TaskStore {
        self.family(kind.family())
    }
}
