//! Filesystem locations for cache state.
//!
//! Loaded from environment variables at backend construction time, with
//! defaults under the user's home directory for development.

use std::path::{Path, PathBuf};

/// Root of the flat-file and binary caches.
pub const CACHE_PATH_ENV: &str = "STRATA_CACHE_PATH";

/// Root of general SDK state (the embedded store lives here).
pub const STATE_PATH_ENV: &str = "STRATA_STATE_PATH";

/// Capacity of the binary blob cache in megabytes.
pub const BIN_CACHE_SIZE_ENV: &str = "STRATA_BIN_CACHE_SIZE_MB";

/// Default binary blob cache capacity in megabytes.
pub const DEFAULT_BIN_CACHE_SIZE_MB: f64 = 1000.0;

/// Resolved cache directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    /// Flat-file and binary cache root.
    pub cache_root: PathBuf,
    /// SDK state root.
    pub state_root: PathBuf,
}

impl CachePaths {
    pub fn new(cache_root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            state_root: state_root.into(),
        }
    }

    /// Both roots under one directory, as `<root>/cache` and `<root>`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("cache"), root)
    }

    /// Load from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_STATE_PATH`: SDK state root (default: `$HOME/.strata`)
    /// - `STRATA_CACHE_PATH`: cache root (default: `<state root>/cache`)
    pub fn from_env() -> Self {
        let state_root = std::env::var_os(STATE_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".strata"));
        let cache_root = std::env::var_os(CACHE_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_root.join("cache"));
        Self {
            cache_root,
            state_root,
        }
    }

    /// Default root of the flat-file backend.
    pub fn objects_dir(&self) -> PathBuf {
        self.cache_root.join("objects")
    }

    /// Root of downloaded binary payloads.
    pub fn binaries_dir(&self) -> PathBuf {
        self.cache_root.join("binaries")
    }

    /// Blob manifest, stored beside the binaries root.
    pub fn manifest_path(&self) -> PathBuf {
        self.cache_root.join("binaries.manifest.json")
    }

    /// Default directory of the embedded store.
    pub fn embedded_dir(&self) -> PathBuf {
        self.state_root.join("cache").join("embedded")
    }
}

/// Binary cache capacity from `STRATA_BIN_CACHE_SIZE_MB`, or the default.
pub fn bin_cache_size_from_env() -> f64 {
    std::env::var(BIN_CACHE_SIZE_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(DEFAULT_BIN_CACHE_SIZE_MB)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}
