//! Size-bounded cache of downloaded binaries.
//!
//! Payload files live under the blob root at
//! `datasets/<dataset>/items/<item>/<file name>`. A JSON manifest beside the
//! root tracks every file in recency order (oldest first) together with the
//! running total size:
//!
//! ```text
//! {"size": 12.5, "keys": ["/cache/binaries/datasets/d1/items/i1/cat.jpg", ...]}
//! ```
//!
//! When a write pushes the total over capacity, the oldest files are evicted
//! until the total is back under [`EVICTION_TARGET_RATIO`] of capacity.
//!
//! # Concurrency
//!
//! Several processes may share one cache root. Every manifest
//! read-modify-write runs under an exclusive advisory lock on a sibling
//! `.lock` file, held by a [`ManifestLock`] guard for the duration of the
//! update and released when the guard drops.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strata_core::{BlobError, CachePaths, CacheResult};

/// Fraction of capacity the total is brought down to by an eviction pass.
pub const EVICTION_TARGET_RATIO: f64 = 0.7;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

static FILENAME_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*?\s*=\s*(?:UTF-8'[^']*')?"?([^";]+)"?"#).ok()
});

fn io_error(path: &Path, e: io::Error) -> BlobError {
    BlobError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Size of a file in megabytes; `None` if it cannot be read.
pub fn file_size_mb(path: &Path) -> Option<f64> {
    fs::metadata(path)
        .ok()
        .map(|metadata| metadata.len() as f64 / BYTES_PER_MB)
}

/// File name carried by a `Content-Disposition` header value.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let regex = (*FILENAME_RE).as_ref()?;
    let name = regex.captures(header)?.get(1)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Last path component of a name, so callers cannot steer writes elsewhere.
fn file_name_component(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .and_then(|component| component.to_str())
        .filter(|component| !component.is_empty())
        .map(str::to_string)
}

// ============================================================================
// MANIFEST
// ============================================================================

/// Persisted record of cached blob files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Total tracked size in megabytes.
    #[serde(rename = "size", default)]
    pub total_size_mb: f64,
    /// Absolute file paths, least recently used first.
    #[serde(rename = "keys", default)]
    pub paths: Vec<PathBuf>,
}

impl Manifest {
    /// Read the manifest at `path`.
    ///
    /// A missing file is an empty manifest. So is a corrupt one: the damage is
    /// logged and the next store overwrites it.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(io_error(path, e).into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt blob manifest, rebuilding");
                Ok(Self::default())
            }
        }
    }

    /// Write the manifest to `path` through a temp file.
    pub fn store(&self, path: &Path) -> CacheResult<()> {
        let json = serde_json::to_vec(self).map_err(|e| BlobError::Manifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).map_err(|e| io_error(&temp, e))?;
        fs::rename(&temp, path).map_err(|e| io_error(path, e))?;
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// Track a file as most recently used.
    ///
    /// A new file adds `size_mb` to the total; a tracked one only moves to the
    /// back.
    pub fn record(&mut self, path: &Path, size_mb: f64) {
        if !self.touch(path) {
            self.paths.push(path.to_path_buf());
            self.total_size_mb += size_mb;
        }
    }

    /// Mark a tracked file as most recently used. Returns false if untracked.
    pub fn touch(&mut self, path: &Path) -> bool {
        let Some(idx) = self.paths.iter().position(|p| p == path) else {
            return false;
        };
        let entry = self.paths.remove(idx);
        self.paths.push(entry);
        true
    }

    /// Stop tracking a file. Returns false if untracked.
    ///
    /// `size_of` reports file sizes. A file that is already gone has no size
    /// to subtract, so the total is reconciled against the remaining entries.
    pub fn remove(&mut self, path: &Path, size_of: impl Fn(&Path) -> Option<f64>) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| p != path);
        if self.paths.len() == before {
            return false;
        }
        self.subtract(path, &size_of);
        true
    }

    /// Drop the oldest entries until the total is at most `target_mb`.
    ///
    /// `keep` is never evicted. `size_of` reports each victim's size. Returns
    /// the evicted paths, oldest first; the caller deletes the files.
    pub fn evict_to(
        &mut self,
        target_mb: f64,
        keep: &Path,
        size_of: impl Fn(&Path) -> Option<f64>,
    ) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while self.total_size_mb > target_mb {
            let Some(idx) = self.paths.iter().position(|p| p != keep) else {
                break;
            };
            let victim = self.paths.remove(idx);
            self.subtract(&victim, &size_of);
            evicted.push(victim);
        }
        evicted
    }

    /// Rebuild the total from the files still present, dropping entries whose
    /// files are gone.
    pub fn reconcile(&mut self, size_of: impl Fn(&Path) -> Option<f64>) {
        let mut total_size_mb = 0.0;
        self.paths.retain(|path| match size_of(path) {
            Some(size_mb) => {
                total_size_mb += size_mb;
                true
            }
            None => false,
        });
        self.total_size_mb = total_size_mb;
    }

    fn subtract(&mut self, removed: &Path, size_of: &impl Fn(&Path) -> Option<f64>) {
        match size_of(removed) {
            Some(size_mb) => self.total_size_mb = (self.total_size_mb - size_mb).max(0.0),
            None => self.reconcile(size_of),
        }
        if self.paths.is_empty() {
            self.total_size_mb = 0.0;
        }
    }
}

// ============================================================================
// LOCK
// ============================================================================

/// Exclusive advisory lock on the manifest's lock file.
///
/// Blocks until the lock is free. Released on drop.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    pub fn acquire(path: &Path) -> CacheResult<Self> {
        let lock_error = |e: io::Error| BlobError::Lock {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_error)?;
        file.lock().map_err(lock_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release manifest lock");
        }
    }
}

// ============================================================================
// BLOB CACHE
// ============================================================================

/// Binary payload handed to the cache for writing.
pub enum BlobPayload<'a> {
    /// A streaming download and its `Content-Disposition` header, if any.
    Response {
        body: &'a mut dyn Read,
        content_disposition: Option<&'a str>,
    },
    /// An in-memory buffer.
    Buffer(&'a [u8]),
}

impl BlobPayload<'_> {
    pub fn content_disposition(&self) -> Option<&str> {
        match self {
            BlobPayload::Response {
                content_disposition,
                ..
            } => *content_disposition,
            BlobPayload::Buffer(_) => None,
        }
    }
}

/// Outcome of recording a blob in the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordOutcome {
    /// Files evicted to make room, oldest first.
    pub evicted: Vec<PathBuf>,
    /// Tracked total after the update, in megabytes.
    pub total_size_mb: f64,
}

/// On-disk binary cache with manifest-driven eviction.
#[derive(Debug, Clone)]
pub struct BlobCache {
    root: PathBuf,
    manifest_path: PathBuf,
    lock_path: PathBuf,
    capacity_mb: f64,
}

impl BlobCache {
    pub fn new(root: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>, capacity_mb: f64) -> Self {
        let manifest_path = manifest_path.into();
        Self {
            root: root.into(),
            lock_path: manifest_path.with_extension("lock"),
            manifest_path,
            capacity_mb,
        }
    }

    /// Blob cache at the standard locations under `paths`.
    pub fn from_paths(paths: &CachePaths, capacity_mb: f64) -> Self {
        Self::new(paths.binaries_dir(), paths.manifest_path(), capacity_mb)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn capacity_mb(&self) -> f64 {
        self.capacity_mb
    }

    /// Where an item's payload is stored.
    ///
    /// The file name is the caller's name, else the content-disposition
    /// filename, else the item id. Only the last path component of a name is
    /// used.
    pub fn destination(
        &self,
        dataset_id: &str,
        item_id: &str,
        file_name: Option<&str>,
        content_disposition: Option<&str>,
    ) -> PathBuf {
        let name = file_name
            .and_then(file_name_component)
            .or_else(|| {
                content_disposition
                    .and_then(filename_from_content_disposition)
                    .as_deref()
                    .and_then(file_name_component)
            })
            .or_else(|| file_name_component(item_id))
            .unwrap_or_else(|| "blob".to_string());

        self.root
            .join("datasets")
            .join(dataset_id)
            .join("items")
            .join(item_id)
            .join(name)
    }

    /// Write a payload to `destination` unless the file already exists.
    ///
    /// Returns the file size in megabytes. On failure the partial file is
    /// removed.
    pub fn store(&self, destination: &Path, payload: BlobPayload<'_>) -> CacheResult<f64> {
        if destination.is_file() {
            return Ok(file_size_mb(destination).unwrap_or(0.0));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let written = File::create(destination).and_then(|mut file| {
            match payload {
                BlobPayload::Response { body, .. } => {
                    io::copy(body, &mut file)?;
                }
                BlobPayload::Buffer(bytes) => file.write_all(bytes)?,
            }
            file.flush()
        });

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(destination) {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %destination.display(), error = %cleanup, "Failed to remove partial blob");
                }
            }
            return Err(io_error(destination, e).into());
        }
        Ok(file_size_mb(destination).unwrap_or(0.0))
    }

    fn with_manifest<T>(&self, update: impl FnOnce(&mut Manifest) -> (T, bool)) -> CacheResult<T> {
        let _lock = ManifestLock::acquire(&self.lock_path)?;
        let mut manifest = Manifest::load(&self.manifest_path)?;
        let (result, changed) = update(&mut manifest);
        if changed {
            manifest.store(&self.manifest_path)?;
        }
        Ok(result)
    }

    /// Track a written file, evicting older files if capacity is exceeded.
    ///
    /// The file just recorded is never evicted by its own write.
    pub fn record(&self, path: &Path, size_mb: f64) -> CacheResult<RecordOutcome> {
        let capacity_mb = self.capacity_mb;
        let outcome = self.with_manifest(|manifest| {
            manifest.record(path, size_mb);
            let evicted = if manifest.total_size_mb > capacity_mb {
                manifest.evict_to(capacity_mb * EVICTION_TARGET_RATIO, path, file_size_mb)
            } else {
                Vec::new()
            };
            for victim in &evicted {
                if let Err(e) = fs::remove_file(victim) {
                    if e.kind() != ErrorKind::NotFound {
                        tracing::warn!(path = %victim.display(), error = %e, "Failed to delete evicted blob");
                    }
                }
            }
            let outcome = RecordOutcome {
                evicted,
                total_size_mb: manifest.total_size_mb,
            };
            (outcome, true)
        })?;

        if !outcome.evicted.is_empty() {
            tracing::info!(
                evicted = outcome.evicted.len(),
                total_size_mb = outcome.total_size_mb,
                capacity_mb,
                "Evicted cached binaries"
            );
        }
        Ok(outcome)
    }

    /// Mark a tracked file as recently used.
    pub fn touch(&self, path: &Path) -> CacheResult<()> {
        self.with_manifest(|manifest| ((), manifest.touch(path)))
    }

    /// Stop tracking a file and delete it. Returns whether it was tracked.
    ///
    /// A file that is already gone is not an error.
    pub fn forget(&self, path: &Path) -> CacheResult<bool> {
        let tracked = self.with_manifest(|manifest| {
            let tracked = manifest.remove(path, file_size_mb);
            (tracked, tracked)
        })?;
        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(io_error(path, e).into()),
            _ => Ok(tracked),
        }
    }

    /// Delete every cached file and reset the manifest.
    pub fn clear(&self) -> CacheResult<()> {
        let root = self.root.clone();
        self.with_manifest(|manifest| {
            *manifest = Manifest::default();
            (fs::remove_dir_all(&root), true)
        })?
        .or_else(|e| match e.kind() {
            ErrorKind::NotFound => Ok(()),
            _ => Err(io_error(&root, e).into()),
        })
    }

    /// Current manifest contents.
    pub fn manifest(&self) -> CacheResult<Manifest> {
        let _lock = ManifestLock::acquire(&self.lock_path)?;
        Manifest::load(&self.manifest_path)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Eviction always lands at or under the target, never drops the
        /// protected entry, and evicts oldest first.
        #[test]
        fn prop_evict_to_target(
            sizes in prop::collection::vec(0.1f64..50.0, 1..20),
            capacity in 1.0f64..100.0,
        ) {
            let paths: Vec<PathBuf> = (0..sizes.len())
                .map(|i| PathBuf::from(format!("/blobs/{i}")))
                .collect();
            let size_of = |path: &Path| {
                paths
                    .iter()
                    .position(|p| p == path)
                    .map(|i| sizes[i])
            };

            let mut manifest = Manifest::default();
            for (path, size) in paths.iter().zip(&sizes) {
                manifest.record(path, *size);
            }
            let keep = paths.last().expect("at least one path").clone();
            let target = capacity * EVICTION_TARGET_RATIO;

            let evicted = manifest.evict_to(target, &keep, size_of);

            prop_assert!(manifest.contains(&keep));
            prop_assert!(!evicted.contains(&keep));
            prop_assert_eq!(&evicted[..], &paths[..evicted.len()]);
            let remaining: f64 = manifest.paths.iter().filter_map(|p| size_of(p)).sum();
            prop_assert!((manifest.total_size_mb - remaining).abs() < 1e-6);
            if manifest.paths.len() > 1 {
                prop_assert!(manifest.total_size_mb <= target + 1e-9);
            }
        }
    }
}
