use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::Environment;
use crate::errors::{ForgeError, Result};
use crate::models::{ArchiveDescriptor, ArchiveShape, BundleKind};
use crate::services::api_client::{ApiClient, ProgressFn};
use crate::services::task_store::CancelProbe;

/// How the archive reached disk; split-origin archives need the spanned-aware
/// extraction path even after reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveOrigin {
    Single,
    Split,
}

#[derive(Clone, Debug)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub origin: ArchiveOrigin,
}

/// Resolves a bundle's remote shape and lands exactly one archive file at the
/// requested destination, whatever the server-side layout.
#[derive(Clone)]
pub struct BundleFetcher {
    api: ApiClient,
    env: Environment,
}

impl BundleFetcher {
    pub fn new(api: ApiClient, env: Environment) -> Self {
        Self { api, env }
    }

    pub async fn fetch(
        &self,
        app_id: u32,
        kind: BundleKind,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelProbe,
    ) -> Result<FetchedArchive> {
        cancel.check()?;
        let descriptor = self
            .api
            .probe(app_id, kind)
            .await?
            .ok_or_else(|| ForgeError::NotAvailable(kind.not_available_message().to_string()))?;

        match descriptor.shape {
            ArchiveShape::Single => {
                self.api
                    .download_bundle(app_id, kind, dest, progress, cancel)
                    .await?;
                Ok(FetchedArchive {
                    path: dest.to_path_buf(),
                    origin: ArchiveOrigin::Single,
                })
            }
            ArchiveShape::Split => self.fetch_split(app_id, kind, &descriptor, dest, progress, cancel).await,
        }
    }

    async fn fetch_split(
        &self,
        app_id: u32,
        kind: BundleKind,
        descriptor: &ArchiveDescriptor,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelProbe,
    ) -> Result<FetchedArchive> {
        let scratch = self
            .env
            .temp_download_dir()
            .join(format!("parts_{}_{}", app_id, Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;

        let outcome = self
            .download_and_reduce(app_id, kind, descriptor, &scratch, dest, progress, cancel)
            .await;

        // The scratch dir holds every part, including partial files from an
        // aborted download; removing it is the cleanup contract.
        let _ = fs::remove_dir_all(&scratch);

        match outcome {
            Ok(()) => Ok(FetchedArchive {
                path: dest.to_path_buf(),
                origin: ArchiveOrigin::Split,
            }),
            Err(err) => {
                let _ = fs::remove_file(dest);
                Err(err)
            }
        }
    }

    async fn download_and_reduce(
        &self,
        app_id: u32,
        kind: BundleKind,
        descriptor: &ArchiveDescriptor,
        scratch: &Path,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelProbe,
    ) -> Result<()> {
        let mut tracker = SplitProgress::new(descriptor.declared_total(), descriptor.parts.len());
        let mut part_paths = Vec::with_capacity(descriptor.parts.len());

        for name in &descriptor.parts {
            cancel.check()?;
            let part_dest = scratch.join(name);
            let size = {
                let mut part_progress = |read: u64, total: u64| {
                    let (cumulative, estimate) = tracker.observe(read, total);
                    progress(cumulative, estimate);
                };
                self.api
                    .download_part(app_id, kind, name, &part_dest, &mut part_progress, cancel)
                    .await?
            };
            tracker.complete_part(size);
            part_paths.push(part_dest);
            tracing::debug!("downloaded part {name} for {app_id} ({size} bytes)");
        }

        cancel.check()?;
        reduce(&part_paths, dest)
    }
}

/// Cumulative progress across the parts of a split download.
///
/// When the server declares part sizes the total is exact; otherwise it is a
/// best-effort estimate seeded from the first part's reported length and
/// revised upward whenever a completed part outgrows its per-part allowance.
/// Read counts are exact either way.
pub(crate) struct SplitProgress {
    part_count: u64,
    completed: u64,
    estimate: u64,
    exact: bool,
}

impl SplitProgress {
    pub(crate) fn new(declared_total: Option<u64>, part_count: usize) -> Self {
        let (estimate, exact) = match declared_total {
            Some(total) if total > 0 => (total, true),
            _ => (0, false),
        };
        Self {
            part_count: part_count.max(1) as u64,
            completed: 0,
            estimate,
            exact,
        }
    }

    pub(crate) fn observe(&mut self, part_read: u64, part_total: u64) -> (u64, u64) {
        if !self.exact && self.estimate == 0 && part_total > 0 {
            self.estimate = part_total * self.part_count;
        }
        (self.completed + part_read, self.estimate)
    }

    pub(crate) fn complete_part(&mut self, size: u64) {
        self.completed += size;
        if self.exact {
            return;
        }
        let allowance = self.estimate / self.part_count;
        if size > allowance {
            self.estimate = size * self.part_count;
        }
        if self.estimate < self.completed {
            self.estimate = self.completed;
        }
    }
}

/// Concatenate split parts into one archive.
///
/// The filename convention leaves the byte order ambiguous (a "main" `.zip`
/// plus numbered `.zNN` continuations), so both plausible orders are tried:
/// main first, then numbered-parts-first-with-main-last. A candidate counts
/// only if the result opens and lists as a zip. The first valid order wins
/// and the source parts are deleted; otherwise no merged file is left behind.
pub fn reduce(parts: &[PathBuf], merged_dest: &Path) -> Result<()> {
    let mut main: Option<&PathBuf> = None;
    let mut numbered: Vec<&PathBuf> = Vec::new();

    for part in parts {
        let name = part
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            main = Some(part);
        } else {
            numbered.push(part);
        }
    }
    numbered.sort_by_key(|part| part_number(part));

    if main.is_none() && numbered.is_empty() {
        return Err(ForgeError::Archive("no split parts to reduce".to_string()));
    }

    let orders: Vec<Vec<&PathBuf>> = match main {
        Some(main) => {
            let mut first = vec![main];
            first.extend(numbered.iter().copied());
            let mut second: Vec<&PathBuf> = numbered.iter().copied().collect();
            second.push(main);
            vec![first, second]
        }
        None => vec![numbered.clone()],
    };

    for order in &orders {
        if let Err(err) = concatenate(order, merged_dest) {
            let _ = fs::remove_file(merged_dest);
            return Err(err.into());
        }
        match archive_entry_names(merged_dest) {
            Ok(_) => {
                for part in parts {
                    let _ = fs::remove_file(part);
                }
                return Ok(());
            }
            Err(err) => {
                tracing::debug!("merge order rejected: {err}");
                let _ = fs::remove_file(merged_dest);
            }
        }
    }

    Err(ForgeError::Archive(
        "cannot reconstruct split archive: no part order yields a readable archive".to_string(),
    ))
}

fn part_number(part: &Path) -> u32 {
    part.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.trim_start_matches(['z', 'Z']).parse().ok())
        .unwrap_or(u32::MAX)
}

fn concatenate(order: &[&PathBuf], dest: &Path) -> io::Result<()> {
    let mut out = fs::File::create(dest)?;
    for part in order {
        let mut input = fs::File::open(part)?;
        io::copy(&mut input, &mut out)?;
    }
    Ok(())
}

/// Open an archive and list its entry names; the cheap structural validity
/// check used by reduction and tests.
pub fn archive_entry_names(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| ForgeError::Archive(err.to_string()))?;
    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| ForgeError::Archive(err.to_string()))?;
        names.push(entry.name().to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_zip, temp_dir, StubResponse, StubServer};

    fn write_parts(dir: &Path, parts: &[(&str, &[u8])]) -> Vec<PathBuf> {
        parts
            .iter()
            .map(|(name, bytes)| {
                let path = dir.join(name);
                fs::write(&path, bytes).unwrap();
                path
            })
            .collect()
    }

    fn sample_archive() -> Vec<u8> {
        make_zip(&[
            ("readme.txt", b"hello there".as_slice()),
            ("bin/data.bin", &[7u8; 4096]),
        ])
    }

    #[test]
    fn reduce_accepts_main_first_convention() {
        let dir = temp_dir("reduce-main-first");
        let archive = sample_archive();
        let (a, rest) = archive.split_at(archive.len() / 3);
        let (b, c) = rest.split_at(rest.len() / 2);
        let parts = write_parts(&dir, &[("100.zip", a), ("100.z01", b), ("100.z02", c)]);

        let merged = dir.join("100_merged.zip");
        reduce(&parts, &merged).unwrap();

        assert_eq!(fs::read(&merged).unwrap(), archive);
        assert_eq!(
            archive_entry_names(&merged).unwrap(),
            vec!["readme.txt".to_string(), "bin/data.bin".to_string()]
        );
        for part in parts {
            assert!(!part.exists(), "source parts must be deleted");
        }
    }

    #[test]
    fn reduce_accepts_numbered_first_convention() {
        let dir = temp_dir("reduce-numbered-first");
        let archive = sample_archive();
        let (a, rest) = archive.split_at(archive.len() / 3);
        let (b, c) = rest.split_at(rest.len() / 2);
        // Main carries the archive tail here, so only numbered-first works.
        let parts = write_parts(&dir, &[("100.z01", a), ("100.z02", b), ("100.zip", c)]);

        let merged = dir.join("merged.zip");
        reduce(&parts, &merged).unwrap();
        assert_eq!(fs::read(&merged).unwrap(), archive);
    }

    #[test]
    fn reduce_failure_leaves_no_merged_file() {
        let dir = temp_dir("reduce-garbage");
        let parts = write_parts(
            &dir,
            &[
                ("9.zip", b"definitely".as_slice()),
                ("9.z01", b"not".as_slice()),
                ("9.z02", b"a zip".as_slice()),
            ],
        );

        let merged = dir.join("merged.zip");
        let err = reduce(&parts, &merged).unwrap_err();
        assert!(matches!(err, ForgeError::Archive(_)));
        assert!(!merged.exists());
        for part in parts {
            assert!(part.exists(), "parts are only consumed on success");
        }
    }

    #[test]
    fn split_progress_exact_when_sizes_declared() {
        let mut tracker = SplitProgress::new(Some(300), 3);
        assert_eq!(tracker.observe(50, 100), (50, 300));
        tracker.complete_part(100);
        assert_eq!(tracker.observe(10, 100), (110, 300));
        // Oversized part never moves an exact total.
        tracker.complete_part(180);
        assert_eq!(tracker.observe(0, 0), (280, 300));
    }

    #[test]
    fn split_progress_estimates_and_revises_upward() {
        let mut tracker = SplitProgress::new(None, 3);
        // First observed length seeds the estimate.
        assert_eq!(tracker.observe(10, 100), (10, 300));
        tracker.complete_part(100);

        // A part above the per-part allowance bumps the estimate.
        tracker.complete_part(150);
        let (read, estimate) = tracker.observe(0, 0);
        assert_eq!(read, 250);
        assert_eq!(estimate, 450);

        // Read counts stay exact and monotone regardless of the estimate.
        let (read, _) = tracker.observe(25, 0);
        assert_eq!(read, 275);
    }

    #[tokio::test]
    async fn fetch_split_end_to_end() {
        let archive = sample_archive();
        let (a, rest) = archive.split_at(archive.len() / 3);
        let (b, c) = rest.split_at(rest.len() / 2);
        let sizes = format!(
            r#"{{"100.zip":{},"100.z01":{},"100.z02":{}}}"#,
            a.len(),
            b.len(),
            c.len()
        );
        let info = format!(
            r#"{{"type":"split","files":["100.zip","100.z01","100.z02"],"sizes":{sizes}}}"#
        );
        let server = StubServer::start(vec![
            (
                "/download/100/info".to_string(),
                StubResponse::ok("application/json", info.into_bytes()),
            ),
            (
                "/download/100/part/100.zip".to_string(),
                StubResponse::ok("application/octet-stream", a.to_vec()),
            ),
            (
                "/download/100/part/100.z01".to_string(),
                StubResponse::ok("application/octet-stream", b.to_vec()),
            ),
            (
                "/download/100/part/100.z02".to_string(),
                StubResponse::ok("application/octet-stream", c.to_vec()),
            ),
        ]);

        let data_dir = temp_dir("fetch-split");
        let env = Environment::new(data_dir.clone(), data_dir.clone(), None);
        let fetcher = BundleFetcher::new(ApiClient::new(server.base_url()), env);

        let dest = data_dir.join("100.zip");
        let mut reads: Vec<u64> = Vec::new();
        let mut progress = |read: u64, _total: u64| reads.push(read);
        let fetched = fetcher
            .fetch(100, BundleKind::Package, &dest, &mut progress, &CancelProbe::never())
            .await
            .unwrap();

        assert_eq!(fetched.origin, ArchiveOrigin::Split);
        assert_eq!(fs::read(&dest).unwrap(), archive);
        assert!(reads.windows(2).all(|w| w[0] <= w[1]));

        // The per-fetch scratch directory is gone.
        let leftovers: Vec<_> = fs::read_dir(data_dir.join("temp_dl"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("parts_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn fetch_split_part_failure_cleans_up() {
        let archive = sample_archive();
        let (a, _) = archive.split_at(archive.len() / 2);
        let info = r#"{"type":"split","files":["7.zip","7.z01"]}"#;
        let server = StubServer::start(vec![
            (
                "/fix/7/info".to_string(),
                StubResponse::ok("application/json", info.as_bytes().to_vec()),
            ),
            (
                "/fix/7/part/7.zip".to_string(),
                StubResponse::ok("application/octet-stream", a.to_vec()),
            ),
            // 7.z01 has no route: the stub answers 404.
        ]);

        let data_dir = temp_dir("fetch-split-fail");
        let env = Environment::new(data_dir.clone(), data_dir.clone(), None);
        let fetcher = BundleFetcher::new(ApiClient::new(server.base_url()), env);

        let dest = data_dir.join("fix_7.zip");
        let err = fetcher
            .fetch(7, BundleKind::Fix, &dest, &mut |_, _| {}, &CancelProbe::never())
            .await
            .unwrap_err();
        assert!(!matches!(err, ForgeError::NotAvailable(_)));
        assert!(!dest.exists());

        let leftovers: Vec<_> = fs::read_dir(data_dir.join("temp_dl"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert!(leftovers.is_empty(), "aborted fetch must delete its partial parts");
    }

    #[tokio::test]
    async fn fetch_maps_probe_none_to_not_available() {
        let server = StubServer::start(vec![(
            "/bypass/200/info".to_string(),
            StubResponse::ok("application/json", br#"{"type":"none"}"#.to_vec()),
        )]);
        let data_dir = temp_dir("fetch-none");
        let env = Environment::new(data_dir.clone(), data_dir.clone(), None);
        let fetcher = BundleFetcher::new(ApiClient::new(server.base_url()), env);

        let err = fetcher
            .fetch(
                200,
                BundleKind::Bypass,
                &data_dir.join("200.zip"),
                &mut |_, _| {},
                &CancelProbe::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotAvailable(ref msg) if msg == BundleKind::Bypass.not_available_message()));
    }
}
