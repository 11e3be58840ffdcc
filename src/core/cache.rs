//! Local image cache validation.
//!
//! The cache root is a flat directory holding one file per catalog image,
//! named after the image. Validation hashes every present entry, deletes
//! files that fail their SHA-256 and deletes anything the current catalog no
//! longer names. Individual file problems are logged and the entry is treated
//! as absent; only an unusable cache root fails the whole pass.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::hasher::{self, HashAlgorithm};
use super::models::{Catalog, Image};

/// Path of a cache file whose SHA-256 matched its image during this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VerifiedPath(PathBuf);

impl VerifiedPath {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for VerifiedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for VerifiedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// What validation concluded about one catalog image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Present and hash-matching.
    Cached(VerifiedPath),
    /// No file at the expected path.
    Missing,
    /// Digest mismatch; the file was deleted.
    Corrupt,
    /// The entry could not be read or removed, or is not a regular file.
    Unreadable(String),
}

impl CacheOutcome {
    pub fn local_path(&self) -> Option<&VerifiedPath> {
        match self {
            Self::Cached(path) => Some(path),
            _ => None,
        }
    }
}

/// Result of one validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheReport {
    /// Outcome per catalog image, keyed by image name.
    pub entries: BTreeMap<String, CacheOutcome>,
    /// Files deleted because no catalog image maps to them.
    pub removed_orphans: Vec<PathBuf>,
}

impl CacheReport {
    /// Verified local path for an image, if it is cached.
    pub fn local_path(&self, name: &str) -> Option<&VerifiedPath> {
        self.entries.get(name).and_then(CacheOutcome::local_path)
    }

    pub fn cached_count(&self) -> usize {
        self.entries
            .values()
            .filter(|outcome| outcome.local_path().is_some())
            .count()
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to prepare cache directory {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Handle on the cache root directory.
///
/// Clones share a lock that serialises mutation of the root (validation and
/// downloads), so a download's staging file is never swept as an orphan.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a downloaded copy of `image` lives.
    pub fn path_for(&self, image: &Image) -> PathBuf {
        self.root.join(&image.name)
    }

    pub(crate) async fn lock_root(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Reconcile the cache root with `catalog`.
    ///
    /// Afterwards the root holds exactly the hash-matching files of images
    /// still in the catalog. Running it twice in a row changes nothing the
    /// second time.
    pub async fn validate(&self, catalog: &Catalog) -> Result<CacheReport, CacheError> {
        let _guard = self.lock_root().await;
        let root = self.root.clone();

        info!(root = %root.display(), images = catalog.len(), "Validating image cache");

        let CacheListing { files: present, others } = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || list_entries(&root)).await??
        };

        let expected: HashSet<PathBuf> = catalog.iter().map(|image| self.path_for(image)).collect();

        let mut report = CacheReport::default();

        let orphans: Vec<PathBuf> = present
            .iter()
            .filter(|path| !expected.contains(*path))
            .cloned()
            .collect();
        report.removed_orphans = tokio::task::spawn_blocking(move || remove_orphans(orphans)).await?;

        // Entries are independent, so hash them concurrently.
        let mut pending = Vec::new();
        for image in catalog.iter() {
            let path = self.path_for(image);
            if others.contains(&path) {
                warn!(image = %image.name, path = %path.display(), "Cached image is not a regular file");
                report.entries.insert(
                    image.name.clone(),
                    CacheOutcome::Unreadable("not a regular file".to_string()),
                );
                continue;
            }
            if !present.contains(&path) {
                debug!(image = %image.name, "Image not cached");
                report.entries.insert(image.name.clone(), CacheOutcome::Missing);
                continue;
            }

            let name = image.name.clone();
            let expected_sha256 = image.sha256.clone();
            let handle =
                tokio::task::spawn_blocking(move || check_entry(&name, path, &expected_sha256));
            pending.push((image.name.clone(), handle));
        }

        for (name, handle) in pending {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(image = %name, error = %e, "Cache check task failed");
                    CacheOutcome::Unreadable(e.to_string())
                }
            };
            report.entries.insert(name, outcome);
        }

        info!(
            cached = report.cached_count(),
            orphans_removed = report.removed_orphans.len(),
            "Cache validation complete"
        );

        Ok(report)
    }
}

/// Entries directly under the cache root, split by whether they can be hashed.
#[derive(Debug, Default)]
struct CacheListing {
    files: HashSet<PathBuf>,
    /// Directories, symlinks and special files. Never hashed or deleted.
    others: HashSet<PathBuf>,
}

/// List `root`, creating it when absent.
fn list_entries(root: &Path) -> Result<CacheListing, CacheError> {
    let root_error = |source| CacheError::Root {
        path: root.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(root).map_err(root_error)?;

    let mut listing = CacheListing::default();
    for entry in std::fs::read_dir(root).map_err(root_error)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable cache entry");
                continue;
            }
        };

        // file_type() does not follow symlinks.
        match entry.file_type() {
            Ok(file_type) if file_type.is_file() => {
                listing.files.insert(entry.path());
            }
            Ok(_) => {
                listing.others.insert(entry.path());
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping cache entry"),
        }
    }

    Ok(listing)
}

fn remove_orphans(orphans: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for path in orphans {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed file not in catalog");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned file"),
        }
    }
    removed
}

fn check_entry(name: &str, path: PathBuf, expected_sha256: &str) -> CacheOutcome {
    let actual = match hasher::checksum(&path, HashAlgorithm::Sha256) {
        Ok(digest) => digest,
        Err(e) => {
            warn!(image = %name, path = %path.display(), error = %e, "Failed to hash cached image");
            return CacheOutcome::Unreadable(e.to_string());
        }
    };

    if actual.eq_ignore_ascii_case(expected_sha256) {
        debug!(image = %name, "Cached image verified");
        return CacheOutcome::Cached(VerifiedPath::new(path));
    }

    warn!(
        image = %name,
        expected = %expected_sha256,
        actual = %actual,
        "Cached image hash mismatch, deleting"
    );
    match std::fs::remove_file(&path) {
        Ok(()) => CacheOutcome::Corrupt,
        Err(e) => {
            warn!(image = %name, error = %e, "Failed to delete corrupt image");
            CacheOutcome::Unreadable(format!("hash mismatch and delete failed: {e}"))
        }
    }
}
