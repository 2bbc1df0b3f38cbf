//! strata core - keys, tier configuration, and entity hierarchy
//!
//! Shared vocabulary for the strata cache:
//! - [`CacheKey`]: hierarchical address of a cached payload
//! - [`CacheConfig`]: one tier's backend, ttl, level, and options
//! - [`EntityHierarchy`]: static owner map driving cascade invalidation
//! - [`CachePaths`]: environment-driven cache directories
//! - error types shared by every crate in the workspace

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod key;
pub mod settings;

pub use config::{BackendKind, CacheConfig, DEFAULT_LEVEL, DEFAULT_TTL_SECS};
pub use error::{BackendError, BlobError, CacheError, CacheResult, ConfigError};
pub use hierarchy::EntityHierarchy;
pub use key::{is_wildcard, CacheKey, PayloadKind, ANY_LEVEL, KEY_SEPARATOR, ONE_LEVEL, ROOT_OWNER};
pub use settings::{
    bin_cache_size_from_env, CachePaths, BIN_CACHE_SIZE_ENV, CACHE_PATH_ENV,
    DEFAULT_BIN_CACHE_SIZE_MB, STATE_PATH_ENV,
};
