//! Deriving cache keys from entity JSON and request paths.
//!
//! Platform entities describe themselves loosely: the type is recoverable from
//! the entity's `url` (`.../datasets/d1/items/i1` names an item), and the owner
//! is referenced either as a `<singular>Id` field (`datasetId`), as an embedded
//! object carrying an `id`, or as a bare id string under the singular name.

use serde_json::Value;
use strata_core::{CacheKey, EntityHierarchy, PayloadKind, ROOT_OWNER};

/// Type assumed for entities that carry an `org` reference but no url.
const ORG_OWNED_TYPE: &str = "projects";

/// Type assumed for entities with neither a url nor an `org` reference.
const FALLBACK_TYPE: &str = "orgs";

/// Path segments of a url or request path, without scheme, host, query, or
/// fragment.
fn path_segments(path: &str) -> Vec<&str> {
    let path = match path.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |idx| &rest[idx..]),
        None => path,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Entity type named by a url: the segment just before the entity's id.
pub fn entity_type_from_url(url: &str, entity_id: &str) -> Option<String> {
    let segments = path_segments(url);
    segments
        .iter()
        .rposition(|segment| *segment == entity_id)
        .filter(|idx| *idx > 0)
        .map(|idx| segments[idx - 1].to_string())
}

/// Object key for the entity a request path names (its last two segments).
pub fn key_from_path(path: &str) -> Option<CacheKey> {
    let segments = path_segments(path);
    match segments.as_slice() {
        [.., entity_type, entity_id] => {
            Some(CacheKey::new(*entity_type, *entity_id, PayloadKind::Object))
        }
        _ => None,
    }
}

/// Item id of a binary download path: the segment after `items`, else the
/// second-to-last segment.
pub fn item_id_from_request_path(path: &str) -> Option<String> {
    let segments = path_segments(path);
    if let Some(idx) = segments.iter().position(|segment| *segment == "items") {
        if let Some(id) = segments.get(idx + 1) {
            return Some((*id).to_string());
        }
    }
    segments
        .len()
        .checked_sub(2)
        .map(|idx| segments[idx].to_string())
}

/// Owner id of `entity` for an owner of `owner_type`.
fn owner_id(entity: &Value, owner_type: &str, hierarchy: &EntityHierarchy) -> Option<String> {
    if let Some(id) = entity.get(hierarchy.id_field(owner_type)).and_then(id_string) {
        return Some(id);
    }
    match entity.get(hierarchy.singular(owner_type))? {
        Value::Object(owner) => owner.get("id").and_then(id_string),
        other => id_string(other),
    }
}

/// Object key for an entity's JSON body.
///
/// `None` when the entity has no `id`. Root types get the [`ROOT_OWNER`]
/// placeholder; types whose owner cannot be found keep a wildcard owner and
/// are cached without a reverse-index entry.
pub fn key_for_entity(entity: &Value, hierarchy: &EntityHierarchy) -> Option<CacheKey> {
    let entity_id = entity.get("id").and_then(id_string)?;

    let entity_type = entity
        .get("url")
        .and_then(Value::as_str)
        .and_then(|url| entity_type_from_url(url, &entity_id))
        .unwrap_or_else(|| {
            if entity.get("org").is_some() {
                ORG_OWNED_TYPE.to_string()
            } else {
                FALLBACK_TYPE.to_string()
            }
        });

    let key = CacheKey::new(entity_type.as_str(), entity_id, PayloadKind::Object);
    if hierarchy.is_root(&entity_type) {
        return Some(key.owned_by(ROOT_OWNER, ROOT_OWNER));
    }

    let owned = hierarchy
        .parent_of(&entity_type)
        .and_then(|parent| Some((parent, owner_id(entity, parent, hierarchy)?)));
    Some(match owned {
        Some((parent, id)) => key.owned_by(parent, id),
        None => key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_from_url() {
        assert_eq!(
            entity_type_from_url("https://gate.example.com/api/v1/items/i1", "i1"),
            Some("items".to_string())
        );
        assert_eq!(
            entity_type_from_url("/datasets/d1/items/i1?fields=all", "d1"),
            Some("datasets".to_string())
        );
        assert_eq!(entity_type_from_url("/items/i1", "i2"), None);
        assert_eq!(entity_type_from_url("i1", "i1"), None);
    }

    #[test]
    fn test_key_for_item_with_dataset_id() {
        let hierarchy = EntityHierarchy::platform();
        let entity = json!({
            "id": "i1",
            "url": "https://gate.example.com/api/v1/items/i1",
            "datasetId": "d1"
        });

        let key = key_for_entity(&entity, &hierarchy).expect("key should derive");
        assert_eq!(key.full(), "datasets/d1/items/i1/object");
    }

    #[test]
    fn test_key_for_owner_as_embedded_object() {
        let hierarchy = EntityHierarchy::platform();
        let entity = json!({
            "id": "d1",
            "url": "/api/v1/datasets/d1",
            "project": {"id": "p1", "name": "demo"}
        });

        let key = key_for_entity(&entity, &hierarchy).expect("key should derive");
        assert_eq!(key.full(), "projects/p1/datasets/d1/object");
    }

    #[test]
    fn test_key_for_owner_as_string_field() {
        let hierarchy = EntityHierarchy::platform();
        let entity = json!({"id": "p1", "org": "o1"});

        let key = key_for_entity(&entity, &hierarchy).expect("key should derive");
        assert_eq!(key.full(), "orgs/o1/projects/p1/object");
    }

    #[test]
    fn test_key_for_root_entity() {
        let hierarchy = EntityHierarchy::platform();
        let key = key_for_entity(&json!({"id": "o1", "name": "acme"}), &hierarchy)
            .expect("key should derive");
        assert_eq!(key.full(), "-/-/orgs/o1/object");
        assert!(key.has_owner());
    }

    #[test]
    fn test_key_without_owner_reference() {
        let hierarchy = EntityHierarchy::platform();
        let entity = json!({"id": "i1", "url": "/items/i1"});

        let key = key_for_entity(&entity, &hierarchy).expect("key should derive");
        assert!(!key.has_owner());
        assert_eq!(key.leaf(), "items/i1/object");
    }

    #[test]
    fn test_numeric_id() {
        let hierarchy = EntityHierarchy::platform();
        let key = key_for_entity(&json!({"id": 42, "url": "/orgs/42"}), &hierarchy)
            .expect("key should derive");
        assert_eq!(key.leaf(), "orgs/42/object");
    }

    #[test]
    fn test_missing_id() {
        let hierarchy = EntityHierarchy::platform();
        assert!(key_for_entity(&json!({"name": "nameless"}), &hierarchy).is_none());
        assert!(key_for_entity(&json!({"id": ""}), &hierarchy).is_none());
    }

    #[test]
    fn test_key_from_path() {
        let key = key_from_path("https://gate.example.com/api/v1/items/i1?with=annotations")
            .expect("key should derive");
        assert_eq!(key.leaf(), "items/i1/object");

        let key = key_from_path("datasets/d1/").expect("key should derive");
        assert_eq!(key.leaf(), "datasets/d1/object");

        assert!(key_from_path("items").is_none());
        assert!(key_from_path("").is_none());
    }

    #[test]
    fn test_item_id_from_request_path() {
        assert_eq!(
            item_id_from_request_path("/items/i1/stream"),
            Some("i1".to_string())
        );
        assert_eq!(
            item_id_from_request_path("https://gate.example.com/api/v1/items/i1/stream?x=1"),
            Some("i1".to_string())
        );
        assert_eq!(
            item_id_from_request_path("/blobs/b7/download"),
            Some("b7".to_string())
        );
        assert_eq!(item_id_from_request_path("download"), None);
    }
}
