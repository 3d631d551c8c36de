//! Tier 3 — Long-term knowledge graph (typed nodes + typed edges, grouped
//! into memories) with a vector side-index, LLM-driven graph edit
//! operations, activation-decay, consolidation, and path-scored retrieval.
//!
//! Node/edge type enums follow `vestige-core::memory::mod`'s closed-set
//! `EdgeType`/`NodeType` pattern (`Display` + `FromStr`-ish lenient parsing).

mod graph_edit;
pub mod graph_store;
mod manager;
pub mod vector_index;

pub use graph_edit::{apply_program, GraphEditOp};
pub use graph_store::{GraphStore, InMemoryGraphStore};
pub use manager::{LongTermManager, TransferResult};
pub use vector_index::{BruteForceIndex, VectorIndex};

#[cfg(feature = "bundled-sqlite")]
pub use graph_store::SqliteGraphStore;
#[cfg(feature = "vector-search")]
pub use vector_index::UsearchIndex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Person,
    Entity,
    Event,
    Topic,
    Attribute,
    Value,
    Time,
    Location,
    Other,
}

impl NodeType {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "person" => Self::Person,
            "entity" => Self::Entity,
            "event" => Self::Event,
            "topic" => Self::Topic,
            "attribute" => Self::Attribute,
            "value" => Self::Value,
            "time" => Self::Time,
            "location" => Self::Location,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Reference,
    Attribute,
    HasProperty,
    Relation,
    Temporal,
    CoreRelation,
    Default,
}

impl EdgeType {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "reference" => Self::Reference,
            "attribute" => Self::Attribute,
            "has_property" => Self::HasProperty,
            "relation" => Self::Relation,
            "temporal" => Self::Temporal,
            "core_relation" => Self::CoreRelation,
            _ => Self::Default,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub content: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(content: String, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            node_type,
            embedding: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub edge_type: EdgeType,
    pub relation_text: String,
    pub importance: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(source_id: Uuid, target_id: Uuid, edge_type: EdgeType, relation_text: impl Into<String>, importance: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            edge_type,
            relation_text: relation_text.into(),
            importance: importance.clamp(0.0, 1.0),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub node_ids: Vec<Uuid>,
    pub edge_ids: Vec<Uuid>,
    pub memory_type: String,
    pub importance: f32,
    pub activation: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub decay_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_label: Option<String>,
}

impl Memory {
    pub fn new(node_ids: Vec<Uuid>, edge_ids: Vec<Uuid>, importance: f32, decay_factor: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            node_ids,
            edge_ids,
            memory_type: "fact".to_string(),
            importance: importance.clamp(0.0, 1.0),
            activation: 1.0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            decay_factor,
            privacy_label: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedStatus {
    Staged,
    Consolidated,
}

/// Transient short-term row awaiting transfer; lifecycle mirrors
/// `ShortTermMemory` but tagged with a `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedMemory {
    pub short_term_id: Uuid,
    pub status: StagedStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_parses_known_and_falls_back_to_other() {
        assert_eq!(NodeType::parse_lenient("Person"), NodeType::Person);
        assert_eq!(NodeType::parse_lenient("whatever"), NodeType::Other);
    }

    #[test]
    fn edge_type_parses_known_and_falls_back_to_default() {
        assert_eq!(EdgeType::parse_lenient("has_property"), EdgeType::HasProperty);
        assert_eq!(EdgeType::parse_lenient("nonsense"), EdgeType::Default);
    }

    #[test]
    fn edge_importance_is_clamped() {
        let e = Edge::new(Uuid::new_v4(), Uuid::new_v4(), EdgeType::Relation, "likes", 5.0);
        assert_eq!(e.importance, 1.0);
    }
}
