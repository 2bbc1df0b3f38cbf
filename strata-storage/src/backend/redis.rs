//! Redis-backed cache tier.
//!
//! Values are stored as JSON text. Expiry is delegated to the server with
//! `SETEX`; a ttl of zero stores with plain `SET`. Pattern scans use
//! `SCAN MATCH`, so they stream through the keyspace instead of blocking the
//! server the way `KEYS` would.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use redis::{Client, Commands, Connection};
use serde_json::Value;
use strata_core::{BackendError, BackendKind, CacheConfig, CacheResult};

use super::pattern::{glob_to_redis, validate_key};
use super::{decode_value, encode_value, no_keys, CacheBackend, KeyIter};

/// Default connect and read timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u64 = 6379;

fn op_error(e: redis::RedisError) -> BackendError {
    BackendError::Operation {
        backend: BackendKind::Redis,
        reason: e.to_string(),
    }
}

fn open_error(e: redis::RedisError) -> BackendError {
    BackendError::Open {
        backend: BackendKind::Redis,
        reason: e.to_string(),
    }
}

/// Build a connection URL from tier options.
///
/// Options:
/// - `url`: full `redis://` URL, used as-is when present
/// - `host` (default `localhost`), `port` (default 6379), `db` (default 0)
/// - `password`: optional
pub fn url_from_config(config: &CacheConfig) -> CacheResult<String> {
    if let Some(url) = config.option_str("url") {
        return Ok(url.to_string());
    }
    let host = config.option_str("host").unwrap_or(DEFAULT_HOST);
    let port = config.option_u64("port")?.unwrap_or(DEFAULT_PORT);
    let db = config.option_u64("db")?.unwrap_or(0);
    let url = match config.option_str("password") {
        Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    };
    Ok(url)
}

/// Networked key/value tier.
pub struct RedisCache {
    client: Client,
    connection: Mutex<Connection>,
    ttl: u64,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("server", &self.client.get_connection_info().addr)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RedisCache {
    /// Connect to the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if the URL is invalid or the server
    /// cannot be reached within `timeout`.
    pub fn connect(url: &str, ttl: u64, timeout: Duration) -> CacheResult<Self> {
        let client = Client::open(url).map_err(open_error)?;
        let connection = client
            .get_connection_with_timeout(timeout)
            .map_err(open_error)?;
        connection
            .set_read_timeout(Some(timeout))
            .map_err(open_error)?;
        connection
            .set_write_timeout(Some(timeout))
            .map_err(open_error)?;

        tracing::debug!(server = %client.get_connection_info().addr, ttl, "Redis cache connected");

        Ok(Self {
            client,
            connection: Mutex::new(connection),
            ttl,
        })
    }

    /// Build from a tier config; see [`url_from_config`] for the options.
    /// `connect_timeout_ms` bounds connect, read and write (default 2000).
    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let url = url_from_config(config)?;
        let timeout_ms = config
            .option_u64("connect_timeout_ms")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        Self::connect(&url, config.ttl, Duration::from_millis(timeout_ms))
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut connection = self.connection();
        let keys = connection.scan_match::<_, String>(pattern)?.collect();
        Ok(keys)
    }
}

impl CacheBackend for RedisCache {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn set(&self, key: &str, value: &Value) -> CacheResult<()> {
        validate_key(key)?;
        let encoded = encode_value(value)?;
        let mut connection = self.connection();
        if self.ttl > 0 {
            connection
                .set_ex::<_, _, ()>(key, encoded, self.ttl)
                .map_err(op_error)?;
        } else {
            connection
                .set::<_, _, ()>(key, encoded)
                .map_err(op_error)?;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        match self.connection().get::<_, Option<String>>(key) {
            Ok(raw) => raw.map(|raw| decode_value(&raw)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Redis cache read failed");
                None
            }
        }
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.connection()
            .del::<_, ()>(key)
            .map_err(op_error)?;
        Ok(())
    }

    fn keys(&self) -> KeyIter {
        match self.scan("*") {
            Ok(keys) => Box::new(keys.into_iter()),
            Err(e) => {
                tracing::warn!(error = %e, "Redis key scan failed");
                no_keys()
            }
        }
    }

    fn list(&self, pattern: &str) -> KeyIter {
        let translated = glob_to_redis(pattern);
        match self.scan(&translated) {
            Ok(keys) => Box::new(keys.into_iter()),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Redis pattern scan failed");
                no_keys()
            }
        }
    }
}
