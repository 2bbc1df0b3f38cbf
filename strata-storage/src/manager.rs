//! Tiered cache manager.
//!
//! Holds one backend per configured level and routes every operation through
//! them:
//!
//! - lookups walk the tiers from the lowest level up and stop at the first hit
//! - writes go to the lowest-level tier
//! - deletes cascade through the entity hierarchy in every tier
//!
//! # Keys
//!
//! An entity's payload lives under its leaf key (`items/i1/object`). When the
//! owner is known, an [`IndexRecord`] is also stored under the full key
//! (`datasets/d1/items/i1/object`) so that invalidating the owner can find it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use strata_core::{
    bin_cache_size_from_env, CacheConfig, CacheKey, CachePaths, CacheResult, ConfigError,
    EntityHierarchy, PayloadKind, ONE_LEVEL, ROOT_OWNER,
};

use crate::backend::{Backend, CacheBackend, KeyIter};
use crate::blob::{BlobCache, BlobPayload};
use crate::entity::{item_id_from_request_path, key_for_entity, key_from_path};
use crate::index::IndexRecord;

/// Entity type of binary payload owners.
const ITEMS: &str = "items";

/// Owner type of items.
const DATASETS: &str = "datasets";

/// Construction options beyond the tier list.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Owner map driving cascade invalidation.
    pub hierarchy: EntityHierarchy,
    /// Binary cache capacity in megabytes.
    pub bin_cache_size_mb: f64,
    /// Cache directories.
    pub paths: CachePaths,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ManagerOptions {
    /// Load from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_CACHE_PATH` / `STRATA_STATE_PATH`: see [`CachePaths::from_env`]
    /// - `STRATA_BIN_CACHE_SIZE_MB`: binary cache capacity (default: 1000)
    pub fn from_env() -> Self {
        Self {
            hierarchy: EntityHierarchy::platform(),
            bin_cache_size_mb: bin_cache_size_from_env(),
            paths: CachePaths::from_env(),
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: EntityHierarchy) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    pub fn with_bin_cache_size(mut self, size_mb: f64) -> Self {
        self.bin_cache_size_mb = size_mb;
        self
    }

    pub fn with_paths(mut self, paths: CachePaths) -> Self {
        self.paths = paths;
        self
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups answered by some tier.
    pub hits: u64,
    /// Lookups no tier could answer.
    pub misses: u64,
    /// Binary files evicted for capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Ordered set of cache tiers plus the binary cache.
#[derive(Debug)]
pub struct CacheManager {
    tiers: BTreeMap<i32, Backend>,
    hierarchy: EntityHierarchy,
    blobs: BlobCache,
    stats: StatsCounters,
}

impl CacheManager {
    /// Build one tier per config.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NoTiers`] for an empty config list
    /// - [`ConfigError::DuplicateLevel`] if two configs share a level
    /// - any backend construction failure, which is fatal
    pub fn new(configs: &[CacheConfig], options: ManagerOptions) -> CacheResult<Self> {
        if configs.is_empty() {
            return Err(ConfigError::NoTiers.into());
        }
        let mut levels = HashSet::new();
        for config in configs {
            if !levels.insert(config.level) {
                return Err(ConfigError::DuplicateLevel {
                    level: config.level,
                }
                .into());
            }
        }

        let mut tiers = Vec::with_capacity(configs.len());
        for config in configs {
            tiers.push((config.level, Backend::open(config, &options.paths)?));
        }
        Self::from_tiers(tiers, options)
    }

    /// Assemble a manager from already-built backends.
    pub fn from_tiers(
        tiers: impl IntoIterator<Item = (i32, Backend)>,
        options: ManagerOptions,
    ) -> CacheResult<Self> {
        let mut by_level = BTreeMap::new();
        for (level, backend) in tiers {
            if by_level.insert(level, backend).is_some() {
                return Err(ConfigError::DuplicateLevel { level }.into());
            }
        }
        if by_level.is_empty() {
            return Err(ConfigError::NoTiers.into());
        }

        let blobs = BlobCache::from_paths(&options.paths, options.bin_cache_size_mb);
        tracing::info!(
            tiers = by_level.len(),
            cache_root = %options.paths.cache_root.display(),
            bin_cache_size_mb = options.bin_cache_size_mb,
            "Cache manager initialized"
        );

        Ok(Self {
            tiers: by_level,
            hierarchy: options.hierarchy,
            blobs,
            stats: StatsCounters::default(),
        })
    }

    fn primary(&self) -> CacheResult<&Backend> {
        self.tiers
            .values()
            .next()
            .ok_or_else(|| ConfigError::NoTiers.into())
    }

    // ========================================================================
    // KEY/VALUE
    // ========================================================================

    /// Look a key up tier by tier; the first hit wins.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let leaf = key.leaf();
        for (level, tier) in &self.tiers {
            if let Some(value) = tier.get(&leaf) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %leaf, tier = *level, "Cache hit");
                return Some(value);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %leaf, "Cache miss");
        None
    }

    /// Store a value in the lowest-level tier.
    ///
    /// Slower tiers are not written. A key with a concrete owner also gets its
    /// reverse-index entry.
    pub fn set(&self, key: &CacheKey, value: &Value) -> CacheResult<()> {
        let tier = self.primary()?;
        tier.set(&key.leaf(), value)?;
        if key.has_owner() {
            tier.set(&key.full(), &IndexRecord::for_key(key).to_value()?)?;
        }
        Ok(())
    }

    /// Remove an entity from every tier, cascading to everything it owns.
    pub fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let mut visited = HashSet::new();
        self.cascade(key.entity_type(), key.entity_id(), &mut visited)
    }

    /// Owner type used when scanning for an entity's index entries.
    fn owner_pattern_type(&self, entity_type: &str) -> &str {
        if self.hierarchy.is_root(entity_type) {
            ROOT_OWNER
        } else {
            self.hierarchy.parent_of(entity_type).unwrap_or(ONE_LEVEL)
        }
    }

    fn cascade(
        &self,
        entity_type: &str,
        entity_id: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> CacheResult<()> {
        if !visited.insert((entity_type.to_string(), entity_id.to_string())) {
            return Ok(());
        }
        tracing::debug!(entity_type, entity_id, "Invalidating cached entity");

        let owner_type = self.owner_pattern_type(entity_type);
        let own_entries = CacheKey::pattern()
            .owned_by(owner_type, ONE_LEVEL)
            .for_entity(entity_type, entity_id)
            .full();
        let children = CacheKey::pattern()
            .owned_by(entity_type, entity_id)
            .full();

        let mut descendants = Vec::new();
        for tier in self.tiers.values() {
            for kind in PayloadKind::ALL {
                let leaf = CacheKey::new(entity_type, entity_id, kind).leaf();
                if kind == PayloadKind::Binary {
                    if let Some(Value::String(path)) = tier.get(&leaf) {
                        self.drop_blob(Path::new(&path));
                    }
                }
                tier.delete(&leaf)?;
            }

            let own: Vec<String> = tier.list(&own_entries).collect();
            for key in own {
                if let Some(record) = tier.get(&key).as_ref().and_then(IndexRecord::from_value) {
                    if let Some(path) = &record.blob_path {
                        self.drop_blob(path);
                    }
                }
                tier.delete(&key)?;
            }

            let owned: Vec<String> = tier.list(&children).collect();
            for key in owned {
                let record = tier.get(&key).as_ref().and_then(IndexRecord::from_value);
                match &record {
                    Some(record) => {
                        if let Some(path) = &record.blob_path {
                            self.drop_blob(path);
                        }
                        descendants.push((record.entity_type.clone(), record.entity_id.clone()));
                    }
                    None => {
                        if let Some(parsed) = CacheKey::parse_full(&key) {
                            descendants.push((
                                parsed.entity_type().to_string(),
                                parsed.entity_id().to_string(),
                            ));
                        }
                    }
                }
                tier.delete(&key)?;
            }
        }

        for (child_type, child_id) in descendants {
            self.cascade(&child_type, &child_id, visited)?;
        }
        Ok(())
    }

    fn drop_blob(&self, path: &Path) {
        if let Err(e) = self.blobs.forget(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove cached binary");
        }
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Cache entity bodies, returning how many were stored.
    ///
    /// Entities without an id, or whose key cannot be stored, are skipped.
    pub fn write(&self, entities: &[Value]) -> usize {
        let mut written = 0;
        for entity in entities {
            let Some(key) = key_for_entity(entity, &self.hierarchy) else {
                tracing::warn!("Skipping entity without an id");
                continue;
            };
            match self.set(&key, entity) {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to cache entity"),
            }
        }
        written
    }

    /// Cached body of the entity a request path names.
    pub fn read(&self, path: &str) -> Option<Value> {
        self.get(&key_from_path(path)?)
    }

    /// Drop the entity a request path names, and everything it owns.
    pub fn invalidate(&self, path: &str) -> CacheResult<()> {
        match key_from_path(path) {
            Some(key) => self.delete(&key),
            None => Ok(()),
        }
    }

    // ========================================================================
    // BINARIES
    // ========================================================================

    fn binary_key(item_id: &str, dataset_id: &str) -> CacheKey {
        CacheKey::new(ITEMS, item_id, PayloadKind::Binary).owned_by(DATASETS, dataset_id)
    }

    /// Local file of a cached binary download.
    ///
    /// A hit refreshes the file's recency. A hit whose file has gone missing
    /// is dropped and reported as a miss.
    pub fn read_stream(&self, request_path: &str, dataset_id: &str) -> Option<PathBuf> {
        let item_id = item_id_from_request_path(request_path)?;
        let key = Self::binary_key(&item_id, dataset_id);
        let Value::String(path) = self.get(&key)? else {
            return None;
        };

        let path = PathBuf::from(path);
        if !path.is_file() {
            tracing::debug!(key = %key.leaf(), path = %path.display(), "Cached binary is gone");
            let leaf = key.leaf();
            for tier in self.tiers.values() {
                if let Err(e) = tier.delete(&leaf) {
                    tracing::warn!(key = %leaf, error = %e, "Failed to drop stale binary entry");
                }
            }
            self.drop_blob(&path);
            return None;
        }

        if let Err(e) = self.blobs.touch(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to refresh binary recency");
        }
        Some(path)
    }

    /// Persist a binary download and cache its location.
    ///
    /// The item id is `entity_id` when given, else derived from the request
    /// path. Returns the local file, or `None` if nothing could be written.
    pub fn write_stream(
        &self,
        request_path: &str,
        payload: BlobPayload<'_>,
        file_name: Option<&str>,
        entity_id: Option<&str>,
        dataset_id: &str,
    ) -> Option<PathBuf> {
        let item_id = entity_id
            .map(str::to_string)
            .or_else(|| item_id_from_request_path(request_path))?;
        let key = Self::binary_key(&item_id, dataset_id);
        let destination =
            self.blobs
                .destination(dataset_id, &item_id, file_name, payload.content_disposition());

        let size_mb = match self.blobs.store(&destination, payload) {
            Ok(size_mb) => size_mb,
            Err(e) => {
                tracing::warn!(key = %key.leaf(), error = %e, "Failed to write binary");
                return None;
            }
        };

        match self.blobs.record(&destination, size_mb) {
            Ok(outcome) => {
                self.stats
                    .evictions
                    .fetch_add(outcome.evicted.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(path = %destination.display(), error = %e, "Failed to update blob manifest");
            }
        }

        let stored = self.primary().and_then(|tier| {
            let location = Value::String(destination.to_string_lossy().into_owned());
            tier.set(&key.leaf(), &location)?;
            let record = IndexRecord::for_key(&key).with_blob_path(&destination);
            tier.set(&key.full(), &record.to_value()?)
        });
        if let Err(e) = stored {
            tracing::warn!(key = %key.leaf(), error = %e, "Failed to cache binary location");
        }
        Some(destination)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Empty every tier and the binary cache.
    pub fn clear(&self) -> CacheResult<()> {
        for tier in self.tiers.values() {
            tier.clear()?;
        }
        self.blobs.clear()?;
        tracing::info!("Cache cleared");
        Ok(())
    }

    /// Every key in every tier, each reported once.
    pub fn keys(&self) -> KeyIter {
        let per_tier: Vec<KeyIter> = self.tiers.values().map(CacheBackend::keys).collect();
        let mut seen = HashSet::new();
        Box::new(
            per_tier
                .into_iter()
                .flatten()
                .filter(move |key| seen.insert(key.clone())),
        )
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Configured levels, lowest first.
    pub fn levels(&self) -> Vec<i32> {
        self.tiers.keys().copied().collect()
    }

    pub fn tier(&self, level: i32) -> Option<&Backend> {
        self.tiers.get(&level)
    }

    pub fn hierarchy(&self) -> &EntityHierarchy {
        &self.hierarchy
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }
}
