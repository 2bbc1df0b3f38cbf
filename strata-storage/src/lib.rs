//! strata storage - cache tiers, cascade invalidation, and blob cache
//!
//! Builds on the vocabulary in `strata-core`:
//! - [`backend`]: the [`CacheBackend`] contract and its embedded (LMDB), Redis,
//!   and flat-file implementations
//! - [`CacheManager`]: ordered tiers with hierarchy-driven invalidation
//! - [`BlobCache`]: manifest-tracked binary downloads with size-bounded eviction

pub mod backend;
pub mod blob;
pub mod entity;
pub mod index;
pub mod manager;

pub use backend::{
    glob_to_path, glob_to_redis, glob_to_regex, validate_key, Backend, CacheBackend,
    EmbeddedCache, FilesystemCache, KeyIter, RedisCache,
};
pub use blob::{
    filename_from_content_disposition, BlobCache, BlobPayload, Manifest, ManifestLock,
    RecordOutcome, EVICTION_TARGET_RATIO,
};
pub use entity::{entity_type_from_url, item_id_from_request_path, key_for_entity, key_from_path};
pub use index::IndexRecord;
pub use manager::{CacheManager, CacheStats, ManagerOptions};
