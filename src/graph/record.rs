//! Raw extractor output and the merged records built from it

use super::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Delimiter placed between distinct description fragments
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

/// Entity type given to stubs and to entities whose type vote is empty
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";

fn default_weight() -> f64 {
    1.0
}

/// An entity as produced by the extractor. Several records may share a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub name: String,
    #[serde(rename = "type", alias = "entity_type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_id: String,
    /// Document the chunk came from, when the extractor knows it
    #[serde(default)]
    pub file_path: String,
}

impl RawEntity {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        description: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: description.into(),
            source_id: source_id.into(),
            file_path: String::new(),
        }
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = file_path.into();
        self
    }

    /// The name used for grouping and locking
    pub fn key(&self) -> &str {
        self.name.trim()
    }
}

/// A relationship as produced by the extractor
///
/// Undirected for merging; the endpoint order is kept for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelationship {
    #[serde(alias = "src_id", alias = "source")]
    pub source_name: String,
    #[serde(alias = "tgt_id", alias = "target")]
    pub target_name: String,
    #[serde(default)]
    pub description: String,
    /// Comma-separated keywords
    #[serde(default)]
    pub keywords: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub file_path: String,
}

impl RawRelationship {
    pub fn new(source: impl Into<String>, target: impl Into<String>, weight: f64) -> Self {
        Self {
            source_name: source.into(),
            target_name: target.into(),
            description: String::new(),
            keywords: String::new(),
            weight,
            source_id: String::new(),
            file_path: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_keywords(mut self, keywords: impl Into<String>) -> Self {
        self.keywords = keywords.into();
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = file_path.into();
        self
    }

    /// Normalized endpoint pair
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source_name.trim(), self.target_name.trim())
    }
}

/// An endpoint pair in canonical (lexicographic) order
///
/// `EdgeKey::new("B", "A") == EdgeKey::new("A", "B")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub a: String,
    pub b: String,
}

impl EdgeKey {
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.a == name || self.b == name
    }

    pub fn is_self_loop(&self) -> bool {
        self.a == self.b
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -- {}", self.a, self.b)
    }
}

/// One extraction batch: the input of a merge job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relationships: Vec<RawRelationship>,
}

impl RawBatch {
    pub fn new(entities: Vec<RawEntity>, relationships: Vec<RawRelationship>) -> Self {
        Self {
            entities,
            relationships,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// The canonical record for one entity after merging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntity {
    pub name: String,
    pub entity_type: String,
    /// Joined fragments, or the summary of them
    pub description: String,
    pub description_fragments: BTreeSet<String>,
    pub source_ids: BTreeSet<String>,
    /// Documents the record was extracted from
    #[serde(default)]
    pub file_paths: BTreeSet<String>,
    pub workspace: Workspace,
    pub updated_at: DateTime<Utc>,
}

impl MergedEntity {
    /// Compare everything except the timestamp
    pub fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.entity_type == other.entity_type
            && self.description == other.description
            && self.description_fragments == other.description_fragments
            && self.source_ids == other.source_ids
            && self.file_paths == other.file_paths
            && self.workspace == other.workspace
    }

    pub fn is_stub(&self) -> bool {
        self.entity_type == UNKNOWN_ENTITY_TYPE
    }
}

/// The canonical record for one relationship after merging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRelationship {
    pub source_name: String,
    pub target_name: String,
    pub description: String,
    pub description_fragments: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    /// Sum of `weight_contributions`
    pub weight: f64,
    /// Weight contributed per source id
    pub weight_contributions: BTreeMap<String, f64>,
    pub source_ids: BTreeSet<String>,
    #[serde(default)]
    pub file_paths: BTreeSet<String>,
    pub workspace: Workspace,
    pub updated_at: DateTime<Utc>,
}

impl MergedRelationship {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source_name.as_str(), self.target_name.as_str())
    }

    /// Keywords joined the way extractors emit them
    pub fn keywords_joined(&self) -> String {
        self.keywords.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Compare everything except the timestamp
    pub fn same_content(&self, other: &Self) -> bool {
        self.source_name == other.source_name
            && self.target_name == other.target_name
            && self.description == other.description
            && self.description_fragments == other.description_fragments
            && self.keywords == other.keywords
            && self.weight == other.weight
            && self.weight_contributions == other.weight_contributions
            && self.source_ids == other.source_ids
            && self.file_paths == other.file_paths
            && self.workspace == other.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_key_is_order_independent() {
        assert_eq!(EdgeKey::new("B", "A"), EdgeKey::new("A", "B"));
        let key = EdgeKey::new("zeta", "alpha");
        assert_eq!(key.a, "alpha");
        assert_eq!(key.b, "zeta");
        assert!(key.contains("zeta"));
        assert!(!key.is_self_loop());
    }

    #[test]
    fn raw_entity_accepts_extractor_field_names() {
        let json = r#"{"name":"Acme","type":"ORGANIZATION","description":"a company","source_id":"chunk-1"}"#;
        let entity: RawEntity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.entity_type, "ORGANIZATION");

        let json = r#"{"name":"Acme","entity_type":"ORGANIZATION"}"#;
        let entity: RawEntity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.entity_type, "ORGANIZATION");
        assert!(entity.description.is_empty());
    }

    #[test]
    fn raw_relationship_defaults_weight_to_one() {
        let json = r#"{"src_id":"A","tgt_id":"B","keywords":"works at"}"#;
        let rel: RawRelationship = serde_json::from_str(json).unwrap();
        assert_eq!(rel.weight, 1.0);
        assert_eq!(rel.key(), EdgeKey::new("A", "B"));
    }

    #[test]
    fn raw_relationship_key_trims_endpoints() {
        let rel = RawRelationship::new(" B ", "A", 2.0);
        assert_eq!(rel.key(), EdgeKey::new("A", "B"));
    }
}
