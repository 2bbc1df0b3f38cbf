//! Cache backend contract and the three tier implementations.
//!
//! Every tier stores JSON values under string keys. Backends differ in where
//! the bytes live and how they enforce expiry:
//!
//! | backend                          | storage              | ttl                   |
//! |----------------------------------|----------------------|-----------------------|
//! | [`EmbeddedCache`]                | local LMDB (heed)    | stamped at `set`      |
//! | [`RedisCache`]                   | remote Redis         | server-side `SETEX`   |
//! | [`FilesystemCache`]              | one file per key     | file modification age |
//!
//! Reads never fail: a query error is logged and reported as a miss or an
//! empty listing, because a broken cache must not break the caller.

pub mod embedded;
pub mod filesystem;
pub mod pattern;
pub mod redis;

pub use embedded::EmbeddedCache;
pub use filesystem::FilesystemCache;
pub use pattern::{glob_to_path, glob_to_redis, glob_to_regex, validate_key};
pub use self::redis::RedisCache;

use serde_json::Value;
use strata_core::{BackendError, BackendKind, CacheConfig, CachePaths, CacheResult};

/// Lazy, finite sequence of keys. Each call that produces one starts fresh.
pub type KeyIter = Box<dyn Iterator<Item = String> + Send>;

/// An empty key sequence.
pub(crate) fn no_keys() -> KeyIter {
    Box::new(std::iter::empty())
}

/// Contract shared by every cache tier.
pub trait CacheBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Store a value.
    ///
    /// Fails with [`strata_core::CacheError::InvalidKey`] for keys that cannot
    /// be stored (see [`validate_key`]).
    fn set(&self, key: &str, value: &Value) -> CacheResult<()>;

    /// Fetch a value; `None` on miss, expiry, or query failure.
    fn get(&self, key: &str) -> Option<Value>;

    /// Remove a value. Absent keys are not an error.
    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Every live key.
    fn keys(&self) -> KeyIter;

    /// Keys matching a key-model pattern (`*` one level, `**` any level).
    fn list(&self, pattern: &str) -> KeyIter;

    /// Remove every entry.
    fn clear(&self) -> CacheResult<()> {
        let keys: Vec<String> = self.keys().collect();
        for key in keys {
            self.delete(&key)?;
        }
        Ok(())
    }
}

/// Encode a value as stored text.
pub(crate) fn encode_value(value: &Value) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| {
        BackendError::Serialization {
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decode stored text, falling back to the raw text for non-JSON payloads.
pub(crate) fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// One configured tier.
#[derive(Debug)]
pub enum Backend {
    Embedded(EmbeddedCache),
    Redis(RedisCache),
    Filesystem(FilesystemCache),
}

impl Backend {
    /// Build the backend a config describes.
    ///
    /// # Errors
    ///
    /// Construction failures (unreachable server, unusable directory, bad
    /// options) are returned as-is; a tier that cannot start is fatal.
    pub fn open(config: &CacheConfig, paths: &CachePaths) -> CacheResult<Self> {
        let backend = match config.backend {
            BackendKind::Embedded => Backend::Embedded(EmbeddedCache::from_config(config, paths)?),
            BackendKind::Redis => Backend::Redis(RedisCache::from_config(config)?),
            BackendKind::Filesystem => {
                Backend::Filesystem(FilesystemCache::from_config(config, paths)?)
            }
        };
        tracing::info!(
            backend = %config.backend,
            level = config.level,
            ttl = config.ttl,
            "Cache tier opened"
        );
        Ok(backend)
    }

    fn inner(&self) -> &dyn CacheBackend {
        match self {
            Backend::Embedded(cache) => cache,
            Backend::Redis(cache) => cache,
            Backend::Filesystem(cache) => cache,
        }
    }
}

impl CacheBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn set(&self, key: &str, value: &Value) -> CacheResult<()> {
        self.inner().set(key, value)
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.inner().get(key)
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner().delete(key)
    }

    fn keys(&self) -> KeyIter {
        self.inner().keys()
    }

    fn list(&self, pattern: &str) -> KeyIter {
        self.inner().list(pattern)
    }

    fn clear(&self) -> CacheResult<()> {
        self.inner().clear()
    }
}

impl From<EmbeddedCache> for Backend {
    fn from(cache: EmbeddedCache) -> Self {
        Backend::Embedded(cache)
    }
}

impl From<RedisCache> for Backend {
    fn from(cache: RedisCache) -> Self {
        Backend::Redis(cache)
    }
}

impl From<FilesystemCache> for Backend {
    fn from(cache: FilesystemCache) -> Self {
        Backend::Filesystem(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_values() {
        for value in [
            json!({"id": "i1", "tags": ["a", "b"], "size": 3}),
            json!("plain string"),
            json!("123"),
            json!(42),
            json!(null),
            json!([1, 2, 3]),
        ] {
            let encoded = encode_value(&value).expect("encode should succeed");
            assert_eq!(decode_value(&encoded), value);
        }
    }

    #[test]
    fn test_decode_raw_text_falls_back_to_string() {
        assert_eq!(decode_value("/tmp/blob.bin"), json!("/tmp/blob.bin"));
    }

    #[test]
    fn test_open_dispatches_on_kind() {
        let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
        let paths = CachePaths::under(dir.path());

        let fs = Backend::open(&CacheConfig::new(BackendKind::Filesystem), &paths)
            .expect("filesystem tier should open");
        assert_eq!(fs.kind(), BackendKind::Filesystem);

        let embedded = Backend::open(
            &CacheConfig::new(BackendKind::Embedded).with_option("map_size_mb", 16),
            &paths,
        )
        .expect("embedded tier should open");
        assert_eq!(embedded.kind(), BackendKind::Embedded);
    }

    #[test]
    fn test_open_unreachable_redis_is_fatal() {
        let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
        let paths = CachePaths::under(dir.path());
        let config = CacheConfig::new(BackendKind::Redis)
            .with_option("url", "redis://127.0.0.1:1/0")
            .with_option("connect_timeout_ms", 200);

        let err = Backend::open(&config, &paths).expect_err("open should fail");
        assert!(matches!(
            err,
            strata_core::CacheError::Backend(BackendError::Open {
                backend: BackendKind::Redis,
                ..
            })
        ));
    }
}
