//! Reverse-index records.
//!
//! Every cached entity with a known owner gets a second entry under its full
//! key. The value is an [`IndexRecord`] pointing back at the leaf entry, so an
//! owner scan can find and drop the entries it covers without re-deriving
//! anything from the key text.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::{BackendError, CacheKey, CacheResult, PayloadKind};

/// Value stored under a full key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub payload_kind: PayloadKind,
    /// Local file holding the payload, for binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_path: Option<PathBuf>,
}

impl IndexRecord {
    /// Record pointing at `key`'s leaf entry.
    ///
    /// A kind wildcard is recorded as an object payload.
    pub fn for_key(key: &CacheKey) -> Self {
        Self {
            entity_type: key.entity_type().to_string(),
            entity_id: key.entity_id().to_string(),
            payload_kind: key.payload_kind().unwrap_or(PayloadKind::Object),
            blob_path: None,
        }
    }

    pub fn with_blob_path(mut self, path: impl AsRef<Path>) -> Self {
        self.blob_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Leaf key of the entry this record indexes.
    pub fn leaf_key(&self) -> String {
        CacheKey::new(&self.entity_type, &self.entity_id, self.payload_kind).leaf()
    }

    pub fn to_value(&self) -> CacheResult<Value> {
        serde_json::to_value(self).map_err(|e| {
            BackendError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Parse a stored record; `None` for anything that is not one.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_shape() {
        let key = CacheKey::new("items", "i1", PayloadKind::Binary).owned_by("datasets", "d1");
        let record = IndexRecord::for_key(&key).with_blob_path("/cache/binaries/cat.jpg");

        assert_eq!(
            record.to_value().expect("record should serialize"),
            json!({
                "entity_type": "items",
                "entity_id": "i1",
                "payload_kind": "binary",
                "blob_path": "/cache/binaries/cat.jpg"
            })
        );
        assert_eq!(record.leaf_key(), "items/i1/binary");
    }

    #[test]
    fn test_object_record_omits_blob_path() {
        let key = CacheKey::new("datasets", "d1", PayloadKind::Object).owned_by("projects", "p1");
        let value = IndexRecord::for_key(&key)
            .to_value()
            .expect("record should serialize");
        assert!(value.get("blob_path").is_none());

        let parsed = IndexRecord::from_value(&value).expect("record should parse");
        assert_eq!(parsed.leaf_key(), "datasets/d1/object");
    }

    #[test]
    fn test_from_value_rejects_other_values() {
        assert!(IndexRecord::from_value(&json!("items/i1/object")).is_none());
        assert!(IndexRecord::from_value(&json!({"id": "i1"})).is_none());
        assert!(IndexRecord::from_value(&json!({
            "entity_type": "items",
            "entity_id": "i1",
            "payload_kind": "thumbnail"
        }))
        .is_none());
    }
}
