use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{ForgeError, Result};
use crate::services::bundle_fetcher::{ArchiveOrigin, FetchedArchive};

/// Ordered extraction strategies: an external 7-Zip binary first (the only
/// strategy that handles spanned archives correctly, even after byte-level
/// reduction), then in-process zip extraction for ordinary archives.
#[derive(Clone)]
pub struct Extractor {
    seven_zip: Option<PathBuf>,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            seven_zip: locate_seven_zip(),
        }
    }

    /// Pin (or disable) the external tool instead of probing the system.
    pub fn with_seven_zip(seven_zip: Option<PathBuf>) -> Self {
        Self { seven_zip }
    }

    pub fn extract(&self, archive: &FetchedArchive, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;

        if let Some(tool) = &self.seven_zip {
            match extract_with_seven_zip(tool, &archive.path, dest) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if archive.origin == ArchiveOrigin::Split {
                        return Err(err);
                    }
                    tracing::warn!(
                        "7z extraction of {} failed, trying built-in unzip: {err}",
                        archive.path.display()
                    );
                }
            }
        } else if archive.origin == ArchiveOrigin::Split {
            // Naive unzip mishandles spanned archives, so a missing tool here
            // is an environment problem, not corrupt data.
            return Err(ForgeError::MissingComponent(
                "7-Zip is required to extract split archives".to_string(),
            ));
        }

        extract_with_zip(&archive.path, dest)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_with_seven_zip(tool: &Path, archive: &Path, dest: &Path) -> Result<()> {
    let output = Command::new(tool)
        .arg("x")
        .arg(archive)
        .arg(format!("-o{}", dest.display()))
        .arg("-y")
        .output()
        .map_err(|err| ForgeError::Archive(format!("failed to launch 7z: {err}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ForgeError::Archive(format!(
            "7z exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn extract_with_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| ForgeError::Archive(err.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| ForgeError::Archive(err.to_string()))?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Find a usable 7-Zip binary: a bundled copy next to the data dir takes
/// priority, then PATH, then the usual Windows install locations.
fn locate_seven_zip() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("bin").join(seven_zip_binary_name()));
        }
    }
    if let Some(found) = find_in_path(seven_zip_binary_name()) {
        candidates.push(found);
    }
    if let Some(found) = find_in_path(seven_zip_alt_binary_name()) {
        candidates.push(found);
    }
    #[cfg(windows)]
    {
        candidates.push(PathBuf::from(r"C:\Program Files\7-Zip\7z.exe"));
        candidates.push(PathBuf::from(r"C:\Program Files (x86)\7-Zip\7z.exe"));
    }

    candidates.into_iter().find(|path| path.is_file())
}

fn seven_zip_binary_name() -> &'static str {
    if cfg!(windows) {
        "7z.exe"
    } else {
        "7z"
    }
}

fn seven_zip_alt_binary_name() -> &'static str {
    if cfg!(windows) {
        "7za.exe"
    } else {
        "7za"
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
