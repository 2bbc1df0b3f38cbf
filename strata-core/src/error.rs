//! Error types for strata cache operations

use crate::BackendKind;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid cache config encoding: {reason}")]
    InvalidEncoding { reason: String },

    #[error("Unsupported backend kind: {kind}")]
    UnsupportedBackend { kind: String },

    #[error("Invalid value for option {field}: {value} - {reason}")]
    InvalidOption {
        field: String,
        value: String,
        reason: String,
    },

    #[error("No cache tiers configured")]
    NoTiers,

    #[error("Duplicate cache tier level {level}")]
    DuplicateLevel { level: i32 },

    #[error("Entity hierarchy cycle through {entity_type}")]
    HierarchyCycle { entity_type: String },
}

/// Storage backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to open {backend} backend: {reason}")]
    Open { backend: BackendKind, reason: String },

    #[error("{backend} backend operation failed: {reason}")]
    Operation { backend: BackendKind, reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

/// Binary blob cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Manifest error at {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Failed to lock {path}: {reason}")]
    Lock { path: String, reason: String },
}

/// Master error type for all strata errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Blob cache error: {0}")]
    Blob(#[from] BlobError),
}

/// Result type alias for strata operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
