//! Cache tier configuration.
//!
//! A [`CacheConfig`] describes one tier: which backend to build, how long its
//! entries live, where it sits in the lookup order, and backend-specific
//! options. Configs travel between processes as base64-encoded JSON:
//!
//! ```text
//! {"type": "embedded", "ttl": 1000, "level": 1, "options": null}
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ConfigError;

/// Default time-to-live for tier entries, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 1000;

/// Default tier level.
pub const DEFAULT_LEVEL: i32 = 1;

/// Storage backend for a cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local LMDB key/value store.
    #[serde(alias = "diskcache")]
    Embedded,
    /// Remote Redis server.
    Redis,
    /// One JSON file per key under a root directory.
    Filesystem,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Redis => "redis",
            BackendKind::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" | "diskcache" => Ok(BackendKind::Embedded),
            "redis" => Ok(BackendKind::Redis),
            "filesystem" => Ok(BackendKind::Filesystem),
            _ => Err(ConfigError::UnsupportedBackend {
                kind: s.to_string(),
            }),
        }
    }
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_level() -> i32 {
    DEFAULT_LEVEL
}

/// Configuration for one cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend to build for this tier.
    #[serde(rename = "type")]
    pub backend: BackendKind,
    /// Entry time-to-live in seconds. Zero disables expiry.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Lookup order; lower levels are checked first.
    #[serde(default = "default_level")]
    pub level: i32,
    /// Backend-specific options.
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(BackendKind::Embedded)
    }
}

impl CacheConfig {
    /// Create a config for the given backend with default ttl and level.
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ttl: DEFAULT_TTL_SECS,
            level: DEFAULT_LEVEL,
            options: None,
        }
    }

    /// Set the entry time-to-live in seconds.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the tier level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Set a backend option.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    fn option(&self, name: &str) -> Option<&Value> {
        self.options.as_ref()?.get(name).filter(|v| !v.is_null())
    }

    /// A string option.
    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.option(name).and_then(Value::as_str)
    }

    /// A path option.
    pub fn option_path(&self, name: &str) -> Option<PathBuf> {
        self.option_str(name).map(PathBuf::from)
    }

    /// An unsigned integer option, given either as a number or a numeric string.
    pub fn option_u64(&self, name: &str) -> Result<Option<u64>, ConfigError> {
        let Some(value) = self.option(name) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| ConfigError::InvalidOption {
            field: name.to_string(),
            value: value.to_string(),
            reason: "must be a non-negative integer".to_string(),
        })
    }

    /// Encode as base64 JSON.
    pub fn to_encoded(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_vec(self).map_err(|e| ConfigError::InvalidEncoding {
            reason: e.to_string(),
        })?;
        Ok(STANDARD.encode(json))
    }

    /// Decode from base64 JSON.
    pub fn from_encoded(encoded: &str) -> Result<Self, ConfigError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::InvalidEncoding {
                reason: format!("base64: {e}"),
            })?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ConfigError::InvalidEncoding {
            reason: format!("json: {e}"),
        })?;

        // Surface unknown kinds as such rather than as a generic decode failure.
        match value.get("type") {
            Some(Value::String(kind)) => {
                kind.parse::<BackendKind>()?;
            }
            _ => {
                return Err(ConfigError::InvalidEncoding {
                    reason: "missing backend type".to_string(),
                })
            }
        }

        serde_json::from_value(value).map_err(|e| ConfigError::InvalidEncoding {
            reason: e.to_string(),
        })
    }
}

impl FromStr for CacheConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_encoded(s)
    }
}
