//! Hierarchical cache keys.
//!
//! A [`CacheKey`] addresses one cached payload of one entity, together with
//! the entity that owns it:
//!
//! ```text
//! full: <owner_type>/<owner_id>/<entity_type>/<entity_id>/<payload_kind>
//! leaf:                         <entity_type>/<entity_id>/<payload_kind>
//! ```
//!
//! Leaf keys are used for direct lookups. Full keys hold the reverse index
//! that lets an invalidation find every entry cached under a given owner.
//! Segments may be glob placeholders (`*` for one level, `**` for any number
//! of levels) when a key is used as a scan pattern.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder matching exactly one key segment.
pub const ONE_LEVEL: &str = "*";

/// Placeholder matching any number of key segments.
pub const ANY_LEVEL: &str = "**";

/// Owner placeholder for entities at the root of the hierarchy.
pub const ROOT_OWNER: &str = "-";

/// Separator between key segments, independent of the host platform.
pub const KEY_SEPARATOR: char = '/';

/// Kind of payload cached for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// The entity's JSON body.
    Object,
    /// A downloaded binary payload, cached as a local file.
    Binary,
}

impl PayloadKind {
    /// Every payload kind, in a stable order.
    pub const ALL: [PayloadKind; 2] = [PayloadKind::Object, PayloadKind::Binary];

    /// The key segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Object => "object",
            PayloadKind::Binary => "binary",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(PayloadKind::Object),
            "binary" => Ok(PayloadKind::Binary),
            other => Err(format!("unknown payload kind: {other}")),
        }
    }
}

/// Returns true if a key segment is a glob placeholder.
pub fn is_wildcard(segment: &str) -> bool {
    segment.contains('*')
}

/// Hierarchical address of a cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    owner_type: String,
    owner_id: String,
    entity_type: String,
    entity_id: String,
    /// `None` matches every payload kind and renders as `*`.
    payload_kind: Option<PayloadKind>,
}

impl CacheKey {
    /// Create a key for an entity payload with an unknown owner.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload_kind: PayloadKind,
    ) -> Self {
        Self {
            owner_type: ANY_LEVEL.to_string(),
            owner_id: ANY_LEVEL.to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload_kind: Some(payload_kind),
        }
    }

    /// A pattern matching every key.
    pub fn pattern() -> Self {
        Self {
            owner_type: ANY_LEVEL.to_string(),
            owner_id: ANY_LEVEL.to_string(),
            entity_type: ONE_LEVEL.to_string(),
            entity_id: ONE_LEVEL.to_string(),
            payload_kind: None,
        }
    }

    /// Set the owning entity.
    pub fn owned_by(mut self, owner_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        self.owner_type = owner_type.into();
        self.owner_id = owner_id.into();
        self
    }

    /// Set the entity type and id.
    pub fn for_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self.entity_id = entity_id.into();
        self
    }

    /// Widen the payload kind to match every kind.
    pub fn any_payload(mut self) -> Self {
        self.payload_kind = None;
        self
    }

    /// Same address with a concrete payload kind.
    pub fn with_payload(&self, payload_kind: PayloadKind) -> Self {
        Self {
            payload_kind: Some(payload_kind),
            ..self.clone()
        }
    }

    pub fn owner_type(&self) -> &str {
        &self.owner_type
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The payload kind, or `None` for a kind wildcard.
    pub fn payload_kind(&self) -> Option<PayloadKind> {
        self.payload_kind
    }

    fn payload_segment(&self) -> &str {
        self.payload_kind.as_ref().map_or(ONE_LEVEL, PayloadKind::as_str)
    }

    /// Full hierarchical key, used for reverse and owner lookups.
    pub fn full(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.owner_type,
            self.owner_id,
            self.entity_type,
            self.entity_id,
            self.payload_segment()
        )
    }

    /// Short key, used for direct lookups.
    pub fn leaf(&self) -> String {
        format!(
            "{}/{}/{}",
            self.entity_type,
            self.entity_id,
            self.payload_segment()
        )
    }

    /// True when both owner segments are concrete.
    pub fn has_owner(&self) -> bool {
        !is_wildcard(&self.owner_type) && !is_wildcard(&self.owner_id)
    }

    /// True when any segment is a placeholder.
    pub fn is_pattern(&self) -> bool {
        self.payload_kind.is_none()
            || [&self.owner_type, &self.owner_id, &self.entity_type, &self.entity_id]
                .into_iter()
                .any(|segment| is_wildcard(segment))
    }

    /// Parse a leaf key (`type/id/kind`).
    pub fn parse_leaf(key: &str) -> Option<Self> {
        let mut parts = key.split(KEY_SEPARATOR);
        let (entity_type, entity_id, kind) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || entity_type.is_empty() || entity_id.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, entity_id, kind.parse().ok()?))
    }

    /// Parse a full key (`owner_type/owner_id/type/id/kind`).
    pub fn parse_full(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        let [owner_type, owner_id, entity_type, entity_id, kind] = parts.as_slice() else {
            return None;
        };
        if parts.iter().any(|part| part.is_empty()) {
            return None;
        }
        Some(Self::new(*entity_type, *entity_id, kind.parse().ok()?).owned_by(*owner_type, *owner_id))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}
