//! Static entity hierarchy.
//!
//! Maps every entity type to the type that owns it. Invalidation walks this
//! map to find the owner listings and descendant entries that must go when an
//! entity changes. The map is built once and injected into the cache manager;
//! nothing mutates it afterwards.

use std::collections::BTreeMap;

use crate::ConfigError;

/// Immutable `entity_type -> parent_type` map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityHierarchy {
    /// `None` marks a root type.
    parents: BTreeMap<String, Option<String>>,
    /// Singular forms that are not the plural minus a trailing `s`.
    singulars: BTreeMap<String, String>,
}

impl EntityHierarchy {
    /// A hierarchy with no types.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The platform's entity hierarchy.
    pub fn platform() -> Self {
        let mut hierarchy = Self::empty();
        hierarchy.parents.insert("orgs".to_string(), None);
        for (child, parent) in [
            ("projects", "orgs"),
            ("datasets", "projects"),
            ("items", "datasets"),
            ("annotations", "items"),
            ("recipes", "datasets"),
            ("annotationtasks", "datasets"),
            ("assignments", "annotationtasks"),
            ("packages", "projects"),
            ("models", "packages"),
            ("services", "packages"),
            ("executions", "services"),
            ("triggers", "projects"),
            ("pipelines", "projects"),
        ] {
            hierarchy
                .parents
                .insert(child.to_string(), Some(parent.to_string()));
        }
        hierarchy
            .singulars
            .insert("annotationtasks".to_string(), "annotationTask".to_string());
        hierarchy
    }

    /// Add a `child -> parent` edge, rejecting edges that close a cycle.
    pub fn with_parent(
        mut self,
        child: impl Into<String>,
        parent: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let child = child.into();
        let parent = parent.into();

        if parent == child || self.ancestors(&parent).contains(&child.as_str()) {
            return Err(ConfigError::HierarchyCycle { entity_type: child });
        }

        self.parents.entry(parent.clone()).or_insert(None);
        self.parents.insert(child, Some(parent));
        Ok(self)
    }

    /// Override the singular form of a type.
    pub fn with_singular(mut self, entity_type: impl Into<String>, singular: impl Into<String>) -> Self {
        self.singulars.insert(entity_type.into(), singular.into());
        self
    }

    /// True if the type is known and has no parent.
    pub fn is_root(&self, entity_type: &str) -> bool {
        matches!(self.parents.get(entity_type), Some(None))
    }

    /// The owning type, if the type is known and not a root.
    pub fn parent_of(&self, entity_type: &str) -> Option<&str> {
        self.parents.get(entity_type)?.as_deref()
    }

    /// Owning types from nearest to root.
    pub fn ancestors(&self, entity_type: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut cursor = self.parent_of(entity_type);
        while let Some(parent) = cursor {
            // Edges are cycle-checked on insert; this bound only guards the walk.
            if chain.len() > self.parents.len() {
                break;
            }
            chain.push(parent);
            cursor = self.parent_of(parent);
        }
        chain
    }

    /// Singular form of a (plural) type name.
    pub fn singular(&self, entity_type: &str) -> String {
        if let Some(singular) = self.singulars.get(entity_type) {
            return singular.clone();
        }
        entity_type
            .strip_suffix('s')
            .unwrap_or(entity_type)
            .to_string()
    }

    /// Field carrying an owner reference of this type, e.g. `datasetId`.
    pub fn id_field(&self, entity_type: &str) -> String {
        format!("{}Id", self.singular(entity_type))
    }

    /// Number of known types.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}
