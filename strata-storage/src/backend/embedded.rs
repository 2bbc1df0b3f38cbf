//! LMDB-backed embedded cache tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a local, memory-mapped
//! key/value store that survives restarts.
//!
//! # Layout
//!
//! Two named databases share one environment:
//! - `entries`: key -> `[expiry: 8 bytes LE][json value]`
//! - `index`: key -> `[expiry: 8 bytes LE]`, scanned by `keys` and `list`
//!   without touching the values
//!
//! Expiry is absolute Unix milliseconds; `0` means the entry never expires.
//!
//! # Transactions
//!
//! Every call opens its own short-lived read or write transaction. No
//! transaction outlives the call that opened it, so the tier can be shared
//! freely between threads.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde_json::Value;
use strata_core::{BackendError, BackendKind, CacheConfig, CachePaths, CacheResult, ConfigError};

use super::pattern::{glob_to_regex, validate_key};
use super::{decode_value, encode_value, no_keys, CacheBackend, KeyIter};

/// Default LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: u64 = 1024;

const EXPIRY_LEN: usize = 8;

fn op_error(e: heed::Error) -> BackendError {
    BackendError::Operation {
        backend: BackendKind::Embedded,
        reason: e.to_string(),
    }
}

fn open_error(reason: impl fmt::Display) -> BackendError {
    BackendError::Open {
        backend: BackendKind::Embedded,
        reason: reason.to_string(),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn read_expiry(bytes: &[u8]) -> Option<i64> {
    let stamp: [u8; EXPIRY_LEN] = bytes.get(..EXPIRY_LEN)?.try_into().ok()?;
    Some(i64::from_le_bytes(stamp))
}

fn is_expired(expiry: i64, now: i64) -> bool {
    expiry != 0 && expiry <= now
}

/// Embedded key/value tier.
pub struct EmbeddedCache {
    env: Env,
    entries: Database<Str, Bytes>,
    index: Database<Str, Bytes>,
    path: PathBuf,
    ttl: u64,
}

impl fmt::Debug for EmbeddedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedCache")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl EmbeddedCache {
    /// Open (or create) the store at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the LMDB files
    /// * `ttl` - Entry lifetime in seconds, `0` for no expiry
    /// * `map_size_mb` - Maximum size of the store in megabytes
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if the directory cannot be created or the
    /// environment cannot be opened. LMDB allows one environment per directory
    /// per process, so two tiers must not share a path.
    pub fn open<P: AsRef<Path>>(path: P, ttl: u64, map_size_mb: u64) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(open_error)?;

        let map_size = usize::try_from(map_size_mb)
            .ok()
            .and_then(|mb| mb.checked_mul(1024 * 1024))
            .filter(|bytes| *bytes > 0)
            .ok_or_else(|| ConfigError::InvalidOption {
                field: "map_size_mb".to_string(),
                value: map_size_mb.to_string(),
                reason: "must be a positive size that fits in memory".to_string(),
            })?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(&path)
        }
        .map_err(open_error)?;

        let mut wtxn = env.write_txn().map_err(open_error)?;
        let entries: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(open_error)?;
        let index: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("index"))
            .map_err(open_error)?;
        wtxn.commit().map_err(open_error)?;

        tracing::debug!(path = %path.display(), ttl, map_size_mb, "Embedded cache opened");

        Ok(Self {
            env,
            entries,
            index,
            path,
            ttl,
        })
    }

    /// Build from a tier config.
    ///
    /// Options:
    /// - `path`: store directory (default: `<state root>/cache/embedded`)
    /// - `map_size_mb`: maximum store size (default: 1024)
    pub fn from_config(config: &CacheConfig, paths: &CachePaths) -> CacheResult<Self> {
        let path = config
            .option_path("path")
            .unwrap_or_else(|| paths.embedded_dir());
        let map_size_mb = config
            .option_u64("map_size_mb")?
            .unwrap_or(DEFAULT_MAP_SIZE_MB);
        Self::open(path, config.ttl, map_size_mb)
    }

    /// Directory holding the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn expiry_for_new_entry(&self) -> i64 {
        if self.ttl == 0 {
            return 0;
        }
        let ttl_millis = i64::try_from(self.ttl.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_millis().saturating_add(ttl_millis)
    }

    fn remove(&self, key: &str) -> Result<bool, heed::Error> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.entries.delete(&mut wtxn, key)?;
        self.index.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Snapshot of live index keys.
    fn live_keys(&self) -> Result<Vec<String>, heed::Error> {
        let now = now_millis();
        let rtxn = self.env.read_txn()?;
        let mut keys = Vec::new();
        for result in self.index.iter(&rtxn)? {
            let (key, stamp) = result?;
            if read_expiry(stamp).is_some_and(|expiry| !is_expired(expiry, now)) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = now_millis();
        let expired: Vec<String> = {
            let rtxn = self.env.read_txn().map_err(op_error)?;
            let mut expired = Vec::new();
            for result in self.index.iter(&rtxn).map_err(op_error)? {
                let (key, stamp) = result.map_err(op_error)?;
                if read_expiry(stamp).map_or(true, |expiry| is_expired(expiry, now)) {
                    expired.push(key.to_string());
                }
            }
            expired
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().map_err(op_error)?;
        for key in &expired {
            self.entries.delete(&mut wtxn, key).map_err(op_error)?;
            self.index.delete(&mut wtxn, key).map_err(op_error)?;
        }
        wtxn.commit().map_err(op_error)?;

        tracing::debug!(count = expired.len(), "Purged expired embedded entries");
        Ok(expired.len())
    }
}

impl CacheBackend for EmbeddedCache {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn set(&self, key: &str, value: &Value) -> CacheResult<()> {
        validate_key(key)?;
        let encoded = encode_value(value)?;
        let expiry = self.expiry_for_new_entry().to_le_bytes();

        let mut bytes = Vec::with_capacity(EXPIRY_LEN + encoded.len());
        bytes.extend_from_slice(&expiry);
        bytes.extend_from_slice(encoded.as_bytes());

        let mut wtxn = self.env.write_txn().map_err(op_error)?;
        self.entries
            .put(&mut wtxn, key, &bytes)
            .map_err(op_error)?;
        self.index
            .put(&mut wtxn, key, &expiry)
            .map_err(op_error)?;
        wtxn.commit().map_err(op_error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        if key.is_empty() {
            return None;
        }

        let lookup = || -> Result<Option<(i64, Value)>, heed::Error> {
            let rtxn = self.env.read_txn()?;
            let Some(bytes) = self.entries.get(&rtxn, key)? else {
                return Ok(None);
            };
            let Some(expiry) = read_expiry(bytes) else {
                return Ok(None);
            };
            let raw = String::from_utf8_lossy(&bytes[EXPIRY_LEN..]);
            Ok(Some((expiry, decode_value(&raw))))
        };

        match lookup() {
            Ok(Some((expiry, value))) => {
                if !is_expired(expiry, now_millis()) {
                    return Some(value);
                }
                // Read txn is closed by now; drop the stale entry.
                if let Err(e) = self.remove(key) {
                    tracing::warn!(key, error = %e, "Failed to remove expired embedded entry");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Embedded cache read failed");
                None
            }
        }
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.remove(key).map_err(op_error)?;
        Ok(())
    }

    fn keys(&self) -> KeyIter {
        match self.live_keys() {
            Ok(keys) => Box::new(keys.into_iter()),
            Err(e) => {
                tracing::warn!(error = %e, "Embedded cache key scan failed");
                no_keys()
            }
        }
    }

    fn list(&self, pattern: &str) -> KeyIter {
        let regex = match glob_to_regex(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Invalid cache pattern");
                return no_keys();
            }
        };
        Box::new(self.keys().filter(move |key| regex.is_match(key)))
    }

    fn clear(&self) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(op_error)?;
        self.entries.clear(&mut wtxn).map_err(op_error)?;
        self.index.clear(&mut wtxn).map_err(op_error)?;
        wtxn.commit().map_err(op_error)?;
        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn json_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ._-]{0,24}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever goes in under a valid key comes back out unchanged.
        #[test]
        fn prop_set_get_roundtrip(
            key in "[a-z]{1,8}/[a-z0-9]{1,8}/(object|binary)",
            value in json_strategy(),
        ) {
            let temp_dir = TempDir::new().expect("TempDir creation should succeed");
            let cache = EmbeddedCache::open(temp_dir.path(), 1000, 8)
                .expect("cache creation should succeed");

            cache.set(&key, &value).expect("set should succeed");
            prop_assert_eq!(cache.get(&key), Some(value));
        }
    }
}
