use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::errors::{ForgeError, Result};
use crate::services::task_store::CancelProbe;
use crate::utils::file::{collect_files, move_file, portable_rel_string, sanitize_relative, write_atomic};

/// The two patch families that leave an undo manifest behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchFamily {
    Fix,
    Bypass,
}

impl PatchFamily {
    pub fn manifest_name(&self) -> &'static str {
        match self {
            PatchFamily::Fix => "FixManifest.txt",
            PatchFamily::Bypass => "BypassManifest.txt",
        }
    }

    pub fn backup_dir_name(&self) -> &'static str {
        match self {
            PatchFamily::Fix => "FixBackup",
            PatchFamily::Bypass => "BypassBackup",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ApplyReport {
    pub files_written: u32,
    pub files_backed_up: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct UndoReport {
    pub files_removed: u32,
    pub files_restored: u32,
    pub restore_failures: u32,
}

/// Moves a patch payload into a target tree and back out again.
///
/// The undo manifest's existence under the target root is the sole source of
/// truth for "is this identifier patched"; the per-identifier mutex only
/// serialises concurrent apply/undo against the same tree, it does not widen
/// that contract.
#[derive(Clone, Default)]
pub struct PatchManager {
    locks: Arc<Mutex<HashMap<(u32, PatchFamily), Arc<tokio::sync::Mutex<()>>>>>,
}

impl PatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, app_id: u32, family: PatchFamily) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("patch lock map poisoned");
        locks
            .entry((app_id, family))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn is_applied(&self, family: PatchFamily, target_root: &Path) -> bool {
        target_root.join(family.manifest_name()).exists()
    }

    /// Move every payload file under `source_dir` into `target_root`, moving
    /// any overwritten original into the backup directory first, then record
    /// the undo manifest.
    ///
    /// A mid-apply failure is not rolled back: already-written files stay put
    /// and, because the manifest is only written on success, a later undo has
    /// nothing to work from. That degraded state needs manual cleanup and is
    /// an accepted risk of the format.
    pub async fn apply(
        &self,
        app_id: u32,
        family: PatchFamily,
        source_dir: &Path,
        target_root: &Path,
        label: &str,
        cancel: &CancelProbe,
    ) -> Result<ApplyReport> {
        let lock = self.lock_for(app_id, family);
        let _guard = lock.lock().await;

        let manifest_path = target_root.join(family.manifest_name());
        if manifest_path.exists() {
            return Err(ForgeError::AlreadyApplied);
        }

        let backup_dir = target_root.join(family.backup_dir_name());
        let payload = collect_files(source_dir)?;
        let mut written: Vec<String> = Vec::with_capacity(payload.len());
        let mut backed_up = 0u32;

        for source in &payload {
            cancel.check()?;

            let raw_rel = source
                .strip_prefix(source_dir)
                .map_err(|_| ForgeError::Config("payload file escapes source dir".to_string()))?;
            let Some(relative) = sanitize_relative(raw_rel) else {
                continue;
            };
            let target = target_root.join(&relative);

            if target.is_file() {
                let backup_path = backup_dir.join(&relative);
                move_file(&target, &backup_path)?;
                backed_up += 1;
                tracing::debug!("backed up {} for {app_id}", relative.display());
            }

            move_file(source, &target)?;
            written.push(portable_rel_string(&relative));
        }

        let manifest = render_manifest(app_id, label, &written);
        write_atomic(&manifest_path, manifest.as_bytes())?;
        tracing::info!(
            "applied {} files for {app_id} ({backed_up} backed up)",
            written.len()
        );

        Ok(ApplyReport {
            files_written: written.len() as u32,
            files_backed_up: backed_up,
        })
    }

    /// Reverse a previous apply: delete every manifest-listed path, move the
    /// backed-up originals back, drop the backup tree, drop the manifest.
    ///
    /// Restoration is maximal rather than all-or-nothing: an individual
    /// backup file that cannot be moved back is logged and skipped.
    pub async fn undo(
        &self,
        app_id: u32,
        family: PatchFamily,
        target_root: &Path,
    ) -> Result<UndoReport> {
        let lock = self.lock_for(app_id, family);
        let _guard = lock.lock().await;

        let manifest_path = target_root.join(family.manifest_name());
        if !manifest_path.exists() {
            return Err(ForgeError::NothingToRemove);
        }
        let listed = read_manifest_paths(&manifest_path)?;

        let mut removed = 0u32;
        for relative in &listed {
            let Some(relative) = sanitize_relative(Path::new(relative)) else {
                continue;
            };
            let target = target_root.join(relative);
            if target.exists() {
                if fs::remove_file(&target).is_ok() {
                    removed += 1;
                }
            }
        }

        let mut restored = 0u32;
        let mut failures = 0u32;
        let backup_dir = target_root.join(family.backup_dir_name());
        if backup_dir.is_dir() {
            for backup_file in collect_files(&backup_dir)? {
                let Ok(relative) = backup_file.strip_prefix(&backup_dir) else {
                    continue;
                };
                let target = target_root.join(relative);
                match move_file(&backup_file, &target) {
                    Ok(()) => restored += 1,
                    Err(err) => {
                        failures += 1;
                        tracing::warn!("failed to restore {}: {err}", relative.display());
                    }
                }
            }
            let _ = fs::remove_dir_all(&backup_dir);
        }

        fs::remove_file(&manifest_path)?;
        tracing::info!(
            "undo for {app_id}: removed {removed}, restored {restored}, failures {failures}"
        );

        Ok(UndoReport {
            files_removed: removed,
            files_restored: restored,
            restore_failures: failures,
        })
    }
}

fn render_manifest(app_id: u32, label: &str, written: &[String]) -> String {
    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
    let mut out = format!("Date: {stamp}\nLabel: {label}\nAppId: {app_id}\nFiles:\n");
    for path in written {
        out.push_str(path);
        out.push('\n');
    }
    out
}

fn read_manifest_paths(manifest_path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(manifest_path)?;
    let mut paths = Vec::new();
    let mut in_files = false;
    for line in text.lines() {
        let line = line.trim();
        if line == "Files:" {
            in_files = true;
            continue;
        }
        if in_files && !line.is_empty() {
            paths.push(line.to_string());
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task_store::{TaskKey, TaskKind, TaskStore};
    use crate::testutil::temp_dir;
    use std::collections::BTreeMap;

    fn write_payload(dir: &Path, files: &[(&str, &[u8])]) {
        for (rel, contents) in files {
            let path = dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
    }

    fn tree_snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut snapshot = BTreeMap::new();
        if root.is_dir() {
            for file in collect_files(root).unwrap() {
                let rel = file.strip_prefix(root).unwrap();
                snapshot.insert(
                    portable_rel_string(rel),
                    fs::read(&file).unwrap(),
                );
            }
        }
        snapshot
    }

    #[tokio::test]
    async fn undo_before_apply_fails_without_writes() {
        let target = temp_dir("undo-first");
        let before = tree_snapshot(&target);

        let err = PatchManager::new()
            .undo(1, PatchFamily::Fix, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NothingToRemove));
        assert_eq!(tree_snapshot(&target), before);
    }

    #[tokio::test]
    async fn apply_backs_up_exactly_the_overwritten_files() {
        let target = temp_dir("apply-backup");
        fs::write(target.join("game.exe"), b"original exe").unwrap();

        let payload = temp_dir("apply-backup-payload");
        write_payload(
            &payload,
            &[
                ("game.exe", b"patched exe".as_slice()),
                ("plugins/hook.dll", b"hook".as_slice()),
            ],
        );

        let manager = PatchManager::new();
        let report = manager
            .apply(55, PatchFamily::Fix, &payload, &target, "Some Game", &CancelProbe::never())
            .await
            .unwrap();

        assert_eq!(report.files_written, 2);
        assert_eq!(report.files_backed_up, 1);
        assert_eq!(fs::read(target.join("game.exe")).unwrap(), b"patched exe");
        assert_eq!(
            fs::read(target.join("FixBackup/game.exe")).unwrap(),
            b"original exe"
        );
        assert!(
            !target.join("FixBackup/plugins/hook.dll").exists(),
            "newly created files must not appear in the backup"
        );

        let manifest = fs::read_to_string(target.join("FixManifest.txt")).unwrap();
        let listed: Vec<&str> = manifest
            .lines()
            .skip_while(|line| *line != "Files:")
            .skip(1)
            .collect();
        assert_eq!(listed, vec!["game.exe", "plugins/hook.dll"]);
        assert!(manager.is_applied(PatchFamily::Fix, &target));
    }

    #[tokio::test]
    async fn second_apply_is_rejected() {
        let target = temp_dir("apply-twice");
        let payload = temp_dir("apply-twice-payload");
        write_payload(&payload, &[("a.bin", b"1".as_slice())]);

        let manager = PatchManager::new();
        manager
            .apply(9, PatchFamily::Bypass, &payload, &target, "G", &CancelProbe::never())
            .await
            .unwrap();

        let payload2 = temp_dir("apply-twice-payload2");
        write_payload(&payload2, &[("a.bin", b"2".as_slice())]);
        let err = manager
            .apply(9, PatchFamily::Bypass, &payload2, &target, "G", &CancelProbe::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::AlreadyApplied));
    }

    #[tokio::test]
    async fn apply_then_undo_round_trips_byte_identically() {
        let target = temp_dir("roundtrip");
        fs::create_dir_all(target.join("data")).unwrap();
        fs::write(target.join("data/original.cfg"), b"keep me").unwrap();
        fs::write(target.join("launcher.exe"), b"stock launcher").unwrap();
        let pristine = tree_snapshot(&target);

        let manager = PatchManager::new();
        for round in 0..2 {
            let payload = temp_dir(&format!("roundtrip-payload-{round}"));
            write_payload(
                &payload,
                &[
                    ("launcher.exe", b"cracked launcher".as_slice()),
                    ("data/extra.pak", b"added".as_slice()),
                    ("newdir/deep/file.bin", b"deep".as_slice()),
                ],
            );

            manager
                .apply(77, PatchFamily::Fix, &payload, &target, "Game 77", &CancelProbe::never())
                .await
                .unwrap();
            assert!(target.join("FixManifest.txt").exists());

            let report = manager
                .undo(77, PatchFamily::Fix, &target)
                .await
                .unwrap();
            assert_eq!(report.restore_failures, 0);
            assert!(!target.join("FixBackup").exists());
            assert!(!target.join("FixManifest.txt").exists());
            // Empty directories may remain; content equality is the contract.
            assert_eq!(tree_snapshot(&target), pristine);
        }
    }

    #[tokio::test]
    async fn undo_tolerates_missing_listed_files() {
        let target = temp_dir("undo-missing");
        let payload = temp_dir("undo-missing-payload");
        write_payload(
            &payload,
            &[("a.bin", b"a".as_slice()), ("b.bin", b"b".as_slice())],
        );

        let manager = PatchManager::new();
        manager
            .apply(4, PatchFamily::Fix, &payload, &target, "G", &CancelProbe::never())
            .await
            .unwrap();
        fs::remove_file(target.join("a.bin")).unwrap();

        let report = manager.undo(4, PatchFamily::Fix, &target).await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(!target.join("b.bin").exists());
    }

    #[tokio::test]
    async fn cancelled_probe_stops_apply_before_any_write() {
        let store = TaskStore::new();
        let key = TaskKey::new(3, TaskKind::Fix);
        store.try_begin(key);
        store.request_cancel(key);
        let cancel = store.cancel_probe(key);

        let target = temp_dir("apply-cancelled");
        let payload = temp_dir("apply-cancelled-payload");
        write_payload(&payload, &[("a.bin", b"a".as_slice())]);

        let err = PatchManager::new()
            .apply(3, PatchFamily::Fix, &payload, &target, "G", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Cancelled));
        assert!(tree_snapshot(&target).is_empty());
        assert!(!target.join("FixManifest.txt").exists());
    }
}
