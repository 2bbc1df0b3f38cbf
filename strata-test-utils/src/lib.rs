//! strata Test Utilities
//!
//! Shared test infrastructure for the strata workspace:
//! - Tracing setup for test output
//! - [`TestCache`]: a cache manager rooted in a temporary directory
//! - Entity JSON fixtures shaped like platform responses
//! - Proptest generators for keys and values
//! - Custom assertions for strata error variants

use std::ops::Deref;
use std::path::Path;

use tempfile::TempDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use strata_core::{
    BackendKind, CacheConfig, CacheError, CacheKey, CachePaths, CacheResult, ConfigError,
    EntityHierarchy, PayloadKind,
};
pub use strata_storage::{BlobPayload, CacheBackend, CacheManager, ManagerOptions};

/// Install a test-friendly subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to debug output from the strata crates.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("strata_storage=debug,strata_core=debug,warn"));
    // A second call in the same process finds a subscriber already set.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// HARNESS
// ============================================================================

/// Cache manager whose state lives in a temporary directory.
///
/// The directory is removed when the harness drops.
pub struct TestCache {
    manager: CacheManager,
    dir: TempDir,
}

impl TestCache {
    /// Embedded tier at level 1 and flat-file tier at level 2, both with the
    /// default ttl.
    pub fn two_tier() -> Self {
        Self::with_configs(&[fixtures::embedded_tier(1), fixtures::filesystem_tier(2)], 1000.0)
    }

    /// Manager over the given tiers with a blob capacity in megabytes.
    pub fn with_configs(configs: &[CacheConfig], bin_cache_size_mb: f64) -> Self {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let options = fixtures::options(dir.path()).with_bin_cache_size(bin_cache_size_mb);
        let manager = CacheManager::new(configs, options).expect("manager should build");
        Self { manager, dir }
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> CachePaths {
        CachePaths::under(self.dir.path())
    }
}

impl Deref for TestCache {
    type Target = CacheManager;

    fn deref(&self) -> &CacheManager {
        &self.manager
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configs and platform entity JSON.

    use super::*;
    use serde_json::{json, Value};

    /// Base url of fixture entities.
    pub const API_BASE: &str = "https://gate.example.com/api/v1";

    /// Manager options rooted at `root`, with the platform hierarchy.
    pub fn options(root: &Path) -> ManagerOptions {
        ManagerOptions {
            hierarchy: EntityHierarchy::platform(),
            bin_cache_size_mb: 1000.0,
            paths: CachePaths::under(root),
        }
    }

    /// Embedded tier with a small map.
    pub fn embedded_tier(level: i32) -> CacheConfig {
        CacheConfig::new(BackendKind::Embedded)
            .with_level(level)
            .with_option("map_size_mb", 16)
    }

    /// Flat-file tier at the default location.
    pub fn filesystem_tier(level: i32) -> CacheConfig {
        CacheConfig::new(BackendKind::Filesystem).with_level(level)
    }

    /// Request path of an entity.
    pub fn url(entity_type: &str, id: &str) -> String {
        format!("{API_BASE}/{entity_type}/{id}")
    }

    /// Request path of an item's binary download.
    pub fn stream_url(item_id: &str) -> String {
        format!("{API_BASE}/items/{item_id}/stream")
    }

    pub fn org(id: &str) -> Value {
        json!({"id": id, "url": url("orgs", id), "name": format!("org {id}")})
    }

    pub fn project(id: &str, org_id: &str) -> Value {
        json!({
            "id": id,
            "url": url("projects", id),
            "name": format!("project {id}"),
            "org": {"id": org_id, "name": format!("org {org_id}")}
        })
    }

    pub fn dataset(id: &str, project_id: &str) -> Value {
        json!({
            "id": id,
            "url": url("datasets", id),
            "name": format!("dataset {id}"),
            "projects": [project_id],
            "projectId": project_id
        })
    }

    pub fn item(id: &str, dataset_id: &str) -> Value {
        json!({
            "id": id,
            "url": url("items", id),
            "filename": format!("/{id}.jpg"),
            "datasetId": dataset_id
        })
    }

    pub fn annotation(id: &str, item_id: &str) -> Value {
        json!({
            "id": id,
            "url": url("annotations", id),
            "type": "box",
            "label": "cat",
            "itemId": item_id
        })
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and cached values.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// A concrete key segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9_.-]{0,11}"
    }

    /// A platform entity type.
    pub fn arb_entity_type() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("orgs"),
            Just("projects"),
            Just("datasets"),
            Just("items"),
            Just("annotations"),
        ]
        .prop_map(str::to_string)
    }

    pub fn arb_payload_kind() -> impl Strategy<Value = PayloadKind> {
        prop_oneof![Just(PayloadKind::Object), Just(PayloadKind::Binary)]
    }

    /// A concrete key with a concrete owner.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (
            arb_entity_type(),
            arb_segment(),
            arb_entity_type(),
            arb_segment(),
            arb_payload_kind(),
        )
            .prop_map(|(owner_type, owner_id, entity_type, entity_id, kind)| {
                CacheKey::new(entity_type, entity_id, kind).owned_by(owner_type, owner_id)
            })
    }

    /// An arbitrary JSON value without floats.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 /._-]{0,32}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for strata error variants.

    use super::*;

    /// Assert that a result is an invalid-key error.
    #[track_caller]
    pub fn assert_invalid_key<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::InvalidKey { .. }) => {}
            other => panic!("Expected InvalidKey error, got: {:?}", other),
        }
    }

    /// Assert that a result is a config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a result is a backend error.
    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Backend(_)) => {}
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }
}
