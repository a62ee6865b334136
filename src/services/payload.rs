//! Installation of full-package payloads into the Steam tree: depot
//! manifests into `depotcache/`, the numeric addon script into
//! `config/stplug-in/<id>.lua`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Environment;
use crate::errors::{ForgeError, Result};
use crate::services::task_store::CancelProbe;
use crate::utils::file::collect_files;

#[derive(Clone, Debug)]
pub struct InstalledPayload {
    pub script_path: PathBuf,
    pub depot_manifests: u32,
}

fn is_numeric_script(name: &str) -> bool {
    match name.strip_suffix(".lua") {
        Some(stem) => !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Install an extracted package payload. Depot manifest copies are
/// best-effort per file; a package without any numeric addon script is
/// structurally unusable and fails.
pub fn install_package(
    env: &Environment,
    app_id: u32,
    payload_root: &Path,
    cancel: &CancelProbe,
) -> Result<InstalledPayload> {
    let script_dir = env
        .addon_script_dir()
        .ok_or_else(|| ForgeError::Config("steam root is not configured".to_string()))?;
    let depot_dir = env
        .depot_cache_dir()
        .ok_or_else(|| ForgeError::Config("steam root is not configured".to_string()))?;

    let files = collect_files(payload_root)?;
    let mut depot_manifests = 0u32;
    let mut script_candidates: Vec<&PathBuf> = Vec::new();

    for file in &files {
        cancel.check()?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name.to_ascii_lowercase().ends_with(".manifest") {
            fs::create_dir_all(&depot_dir)?;
            let dest = depot_dir.join(&name);
            match fs::copy(file, &dest) {
                Ok(_) => {
                    depot_manifests += 1;
                    tracing::debug!("installed depot manifest {name}");
                }
                Err(err) => tracing::warn!("failed to install depot manifest {name}: {err}"),
            }
        } else if is_numeric_script(&name) {
            script_candidates.push(file);
        }
    }

    let preferred = format!("{app_id}.lua");
    let chosen = script_candidates
        .iter()
        .find(|path| path.file_name() == Some(std::ffi::OsStr::new(&preferred)))
        .or_else(|| script_candidates.first())
        .ok_or_else(|| {
            ForgeError::Archive("no addon script found in package payload".to_string())
        })?;

    cancel.check()?;
    fs::create_dir_all(&script_dir)?;
    let script_path = script_dir.join(&preferred);
    fs::copy(chosen, &script_path)?;
    tracing::info!("installed addon script {}", script_path.display());

    Ok(InstalledPayload {
        script_path,
        depot_manifests,
    })
}

/// Remove everything a package install left behind: addon script (enabled or
/// disabled), depot manifests naming the identifier, and the saved metadata
/// JSON. Returns the paths actually deleted.
pub fn delete_package_files(env: &Environment, app_id: u32) -> Vec<PathBuf> {
    let mut deleted = Vec::new();

    if let Some(script_dir) = env.addon_script_dir() {
        for name in [format!("{app_id}.lua"), format!("{app_id}.lua.disabled")] {
            let path = script_dir.join(name);
            if path.exists() && fs::remove_file(&path).is_ok() {
                deleted.push(path);
            }
        }
    }

    if let Some(depot_dir) = env.depot_cache_dir() {
        if let Ok(entries) = fs::read_dir(&depot_dir) {
            let id_text = app_id.to_string();
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.contains(&id_text) && name.to_ascii_lowercase().ends_with(".manifest") {
                    let path = entry.path();
                    match fs::remove_file(&path) {
                        Ok(()) => deleted.push(path),
                        Err(err) => tracing::warn!("failed to delete {name}: {err}"),
                    }
                }
            }
        }
    }

    let metadata = env.releases_dir().join(format!("{app_id}.json"));
    if metadata.exists() && fs::remove_file(&metadata).is_ok() {
        deleted.push(metadata);
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    fn env_with_steam(tag: &str) -> Environment {
        let data = temp_dir(&format!("{tag}-data"));
        let steam = temp_dir(&format!("{tag}-steam"));
        Environment::new(data.clone(), data, Some(steam))
    }

    #[test]
    fn installs_preferred_script_and_manifests() {
        let env = env_with_steam("payload-install");
        let payload = temp_dir("payload-install-src");
        fs::create_dir_all(payload.join("inner")).unwrap();
        fs::write(payload.join("999.lua"), b"other").unwrap();
        fs::write(payload.join("inner/42.lua"), b"addon").unwrap();
        fs::write(payload.join("inner/123_456.manifest"), b"depot").unwrap();
        fs::write(payload.join("readme.txt"), b"skip").unwrap();

        let installed = install_package(&env, 42, &payload, &CancelProbe::never()).unwrap();
        assert_eq!(installed.depot_manifests, 1);
        assert_eq!(
            fs::read(env.addon_script_dir().unwrap().join("42.lua")).unwrap(),
            b"addon"
        );
        assert_eq!(
            fs::read(env.depot_cache_dir().unwrap().join("123_456.manifest")).unwrap(),
            b"depot"
        );
    }

    #[test]
    fn package_without_script_is_rejected() {
        let env = env_with_steam("payload-noscript");
        let payload = temp_dir("payload-noscript-src");
        fs::write(payload.join("notes.txt"), b"nothing useful").unwrap();

        let err = install_package(&env, 5, &payload, &CancelProbe::never()).unwrap_err();
        assert!(matches!(err, ForgeError::Archive(_)));
    }

    #[test]
    fn delete_removes_script_manifests_and_metadata() {
        let env = env_with_steam("payload-delete");
        let script_dir = env.addon_script_dir().unwrap();
        let depot_dir = env.depot_cache_dir().unwrap();
        fs::create_dir_all(&script_dir).unwrap();
        fs::create_dir_all(&depot_dir).unwrap();
        fs::create_dir_all(env.releases_dir()).unwrap();
        fs::write(script_dir.join("42.lua"), b"x").unwrap();
        fs::write(depot_dir.join("42_abc.manifest"), b"x").unwrap();
        fs::write(depot_dir.join("777.manifest"), b"x").unwrap();
        fs::write(env.releases_dir().join("42.json"), b"{}").unwrap();

        let deleted = delete_package_files(&env, 42);
        assert_eq!(deleted.len(), 3);
        assert!(!script_dir.join("42.lua").exists());
        assert!(depot_dir.join("777.manifest").exists());
    }
}
