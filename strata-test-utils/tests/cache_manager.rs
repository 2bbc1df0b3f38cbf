//! Behavioral tests for the tiered cache manager.

use serde_json::json;
use strata_test_utils::assertions::{
    assert_backend_error, assert_config_error, assert_invalid_key,
};
use strata_test_utils::fixtures::{self, url};
use strata_test_utils::generators::{arb_cache_key, arb_json_value};
use strata_test_utils::{
    init_tracing, BackendKind, CacheBackend, CacheConfig, CacheKey, CacheManager, PayloadKind,
    TestCache,
};

#[test]
fn test_write_read_invalidate_scenario() {
    init_tracing();
    let cache = TestCache::two_tier();
    let item_url = url("items", "i1");

    let written = cache.write(&[json!({"id": "i1", "url": item_url})]);
    assert_eq!(written, 1);
    assert_eq!(
        cache.read(&item_url),
        Some(json!({"id": "i1", "url": item_url}))
    );

    cache.invalidate(&item_url).expect("invalidate should succeed");
    assert_eq!(cache.read(&item_url), None);
}

#[test]
fn test_cascade_from_dataset_clears_items_and_annotations() {
    init_tracing();
    let cache = TestCache::two_tier();

    cache.write(&[
        fixtures::org("o1"),
        fixtures::project("p1", "o1"),
        fixtures::dataset("d1", "p1"),
        fixtures::item("i1", "d1"),
        fixtures::item("i2", "d1"),
        fixtures::annotation("a1", "i1"),
        fixtures::dataset("d2", "p1"),
        fixtures::item("i3", "d2"),
    ]);

    cache
        .invalidate(&url("datasets", "d1"))
        .expect("invalidate should succeed");

    for (entity_type, id) in [("datasets", "d1"), ("items", "i1"), ("items", "i2"), ("annotations", "a1")] {
        assert_eq!(cache.read(&url(entity_type, id)), None, "{entity_type}/{id} should be gone");
    }
    for (entity_type, id) in [("orgs", "o1"), ("projects", "p1"), ("datasets", "d2"), ("items", "i3")] {
        assert!(cache.read(&url(entity_type, id)).is_some(), "{entity_type}/{id} should survive");
    }
}

#[test]
fn test_cascade_reaches_every_tier() {
    init_tracing();
    let cache = TestCache::two_tier();
    let slow = cache.tier(2).expect("tier 2 exists");

    // Seed the slow tier directly, the way another process would have.
    let item = CacheKey::new("items", "i1", PayloadKind::Object).owned_by("datasets", "d1");
    slow.set(&item.leaf(), &fixtures::item("i1", "d1"))
        .expect("set should succeed");
    slow.set(
        &item.full(),
        &strata_storage::IndexRecord::for_key(&item)
            .to_value()
            .expect("record should serialize"),
    )
    .expect("set should succeed");
    cache.write(&[fixtures::dataset("d1", "p1")]);

    cache
        .delete(&CacheKey::new("datasets", "d1", PayloadKind::Object))
        .expect("delete should succeed");

    assert_eq!(slow.get(&item.leaf()), None);
    assert_eq!(slow.get(&item.full()), None);
    assert_eq!(cache.keys().count(), 0);
}

#[test]
fn test_invalidating_org_clears_whole_tree() {
    init_tracing();
    let cache = TestCache::two_tier();
    cache.write(&[
        fixtures::org("o1"),
        fixtures::project("p1", "o1"),
        fixtures::dataset("d1", "p1"),
        fixtures::item("i1", "d1"),
    ]);

    cache.invalidate(&url("orgs", "o1")).expect("invalidate should succeed");
    assert_eq!(cache.keys().count(), 0);
}

#[test]
fn test_lower_level_tier_wins() {
    init_tracing();
    let cache = TestCache::two_tier();
    let key = CacheKey::new("items", "i1", PayloadKind::Object);

    cache
        .tier(2)
        .expect("tier 2 exists")
        .set(&key.leaf(), &json!("from level 2"))
        .expect("set should succeed");
    assert_eq!(cache.get(&key), Some(json!("from level 2")));

    cache
        .tier(1)
        .expect("tier 1 exists")
        .set(&key.leaf(), &json!("from level 1"))
        .expect("set should succeed");
    assert_eq!(cache.get(&key), Some(json!("from level 1")));
}

#[test]
fn test_tier_order_follows_level_not_config_order() {
    init_tracing();
    let cache = TestCache::with_configs(
        &[fixtures::filesystem_tier(7), fixtures::embedded_tier(3)],
        100.0,
    );
    assert_eq!(cache.levels(), vec![3, 7]);
    assert_eq!(
        cache.tier(3).map(CacheBackend::kind),
        Some(BackendKind::Embedded)
    );

    cache
        .set(&CacheKey::new("items", "i1", PayloadKind::Object), &json!(1))
        .expect("set should succeed");
    assert!(cache
        .tier(3)
        .expect("tier 3 exists")
        .get("items/i1/object")
        .is_some());
}

#[test]
fn test_construction_errors() {
    let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
    let options = fixtures::options(dir.path());

    assert_config_error(&CacheManager::new(&[], options.clone()));
    assert_config_error(&CacheManager::new(
        &[fixtures::filesystem_tier(1), fixtures::embedded_tier(1)],
        options.clone(),
    ));

    // An unreachable tier is fatal, even behind a working one.
    let unreachable = CacheConfig::new(BackendKind::Redis)
        .with_level(2)
        .with_option("url", "redis://127.0.0.1:1/0")
        .with_option("connect_timeout_ms", 200);
    assert_backend_error(&CacheManager::new(
        &[fixtures::filesystem_tier(1), unreachable],
        options,
    ));
}

#[test]
fn test_encoded_configs_build_a_manager() {
    init_tracing();
    let encoded: Vec<String> = [fixtures::embedded_tier(1), fixtures::filesystem_tier(2)]
        .iter()
        .map(|config| config.to_encoded().expect("encode should succeed"))
        .collect();
    let configs: Vec<CacheConfig> = encoded
        .iter()
        .map(|s| s.parse().expect("decode should succeed"))
        .collect();

    let cache = TestCache::with_configs(&configs, 100.0);
    assert_eq!(cache.levels(), vec![1, 2]);
}

#[test]
fn test_invalid_keys_are_rejected() {
    let cache = TestCache::two_tier();
    assert_invalid_key(&cache.set(&CacheKey::pattern(), &json!(1)));
    assert_invalid_key(&cache.set(
        &CacheKey::new("items", "*", PayloadKind::Object),
        &json!(1),
    ));
}

#[test]
fn test_skips_entities_without_id() {
    let cache = TestCache::two_tier();
    let written = cache.write(&[json!({"name": "no id"}), fixtures::item("i1", "d1")]);
    assert_eq!(written, 1);
}

#[test]
fn test_stats_track_hits_and_misses() {
    let cache = TestCache::two_tier();
    cache.write(&[fixtures::item("i1", "d1")]);

    assert!(cache.read(&url("items", "i1")).is_some());
    assert!(cache.read(&url("items", "missing")).is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.5);
}

mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// A value set through the manager reads back unchanged, and deleting
        /// its key makes it a miss.
        #[test]
        fn prop_set_get_delete(key in arb_cache_key(), value in arb_json_value()) {
            let cache = TestCache::two_tier();

            cache.set(&key, &value).expect("set should succeed");
            prop_assert_eq!(cache.get(&key), Some(value));

            cache.delete(&key).expect("delete should succeed");
            prop_assert_eq!(cache.get(&key), None);
        }
    }
}
