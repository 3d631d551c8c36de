//! Tier 2 — Short-term structured-memory store with LLM-guided
//! create/merge/update/discard decisions and bounded capacity.
//!
//! Grounded on `spec.md` §4.2; struct shape follows `vestige-core::memory::node`'s
//! pattern of a serde-derived record with a closed-set enum field
//! (`as_str`/`parse_name`-style normalization, here folded into
//! `MemoryType::parse_lenient`).

mod manager;
mod persistence;

pub use manager::ShortTermManager;
pub use persistence::ShortTermSnapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Opinion,
    Relation,
    Event,
    Other,
}

impl MemoryType {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "fact" => Self::Fact,
            "opinion" => Self::Opinion,
            "relation" => Self::Relation,
            "event" => Self::Event,
            _ => Self::Other,
        }
    }
}

/// Structured record produced by the LLM from one perceptual block.
///
/// `embedding` is intentionally excluded from `Serialize`/`Deserialize`: it
/// is generated lazily and cached in memory only, per the invariant in
/// `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub id: Uuid,
    pub chat_id: String,
    pub subject: String,
    pub memory_type: MemoryType,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub source_block_ids: Vec<Uuid>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl ShortTermMemory {
    pub fn new(chat_id: impl Into<String>, subject: impl Into<String>, memory_type: MemoryType, topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            subject: subject.into(),
            memory_type,
            topic: topic.into(),
            object: None,
            attributes: HashMap::new(),
            importance: 0.5,
            created_at: Utc::now(),
            source_block_ids: Vec::new(),
            embedding: None,
        }
    }
}

/// Normalized op produced by the LLM decision-parsing pipeline (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOp {
    CreateNew,
    Merge,
    Update,
    Discard,
}

impl DecisionOp {
    /// Lowercase + `-`→`_` normalization; unrecognized values default to
    /// `CreateNew` per `spec.md` §4.2 step 5.
    pub fn parse_normalized(raw: &str) -> Self {
        match crate::json_tolerant::normalize_op(raw).as_str() {
            "merge" => Self::Merge,
            "update" => Self::Update,
            "discard" => Self::Discard,
            "create_new" => Self::CreateNew,
            _ => Self::CreateNew,
        }
    }
}

/// Fields the LLM may supply when creating or updating a memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryFields {
    pub subject: Option<String>,
    pub memory_type: Option<String>,
    pub topic: Option<String>,
    pub object: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub importance: Option<f32>,
}

/// One LLM decision about a block, after tolerant parsing and
/// normalization.
#[derive(Debug, Clone)]
pub struct Decision {
    pub op: DecisionOp,
    pub target_id: Option<Uuid>,
    pub memory_fields: Option<MemoryFields>,
    pub reasoning: String,
}

impl Decision {
    /// Parse a raw LLM response into a `Decision`, applying the full
    /// tolerant-JSON pipeline from `spec.md` §4.2 steps 1-6. Never fails:
    /// malformed input degrades to a bare `CreateNew` with empty fields.
    pub fn parse(raw: &str) -> Self {
        let Some(value) = crate::json_tolerant::parse_tolerant(raw) else {
            tracing::debug!(payload = %raw, "short-term decision parse failed entirely; defaulting to create_new");
            return Self {
                op: DecisionOp::CreateNew,
                target_id: None,
                memory_fields: None,
                reasoning: String::new(),
            };
        };

        let op_raw = value.get("op").and_then(|v| v.as_str()).unwrap_or("create_new");
        let mut op = DecisionOp::parse_normalized(op_raw);

        let target_id = value
            .get("target_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        // step 6: MERGE/UPDATE with a missing target_id falls back to CREATE_NEW.
        if matches!(op, DecisionOp::Merge | DecisionOp::Update) && target_id.is_none() {
            op = DecisionOp::CreateNew;
        }

        let memory_fields = value
            .get("memory_fields")
            .and_then(|v| serde_json::from_value::<MemoryFields>(v.clone()).ok());

        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Self {
            op,
            target_id: if matches!(op, DecisionOp::CreateNew) { None } else { target_id },
            memory_fields,
            reasoning,
        }
    }
}
