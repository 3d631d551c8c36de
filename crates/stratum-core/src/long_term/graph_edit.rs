//! Graph-edit programs: the ordered list of create/update/merge operations
//! an LLM call produces for one short-term memory, and their execution.
//!
//! Parsing reuses the `json_tolerant` pipeline (§4.2) plus the extra shapes
//! `spec.md` §4.3 step 3 allows: a bare object, a bare array, or an object
//! with an `operations` key.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Edge, EdgeType, GraphStore, Memory, Node, NodeType};
use crate::batch_scheduler::{BatchScheduler, WriteOp};
use crate::error::GraphStoreError;
use crate::json_tolerant::{normalize_op, parse_tolerant};

#[derive(Debug, Clone)]
pub enum GraphEditOp {
    CreateNode {
        temp_id: Option<String>,
        content: String,
        node_type: NodeType,
    },
    CreateEdge {
        source_ref: String,
        target_ref: String,
        edge_type: EdgeType,
        relation_text: String,
        importance: f32,
    },
    UpdateMemory {
        memory_id_ref: String,
        importance: Option<f32>,
    },
    MergeMemories {
        memory_id_refs: Vec<String>,
    },
    CreateMemory {
        node_refs: Vec<String>,
        importance: f32,
    },
}

/// Parse one LLM response into an ordered op list. Never fails: an
/// unparseable payload or `{}` yields an empty program, per `spec.md` §7 and
/// the `{}`-is-empty-program boundary behavior in §8.
pub fn parse_program(raw: &str) -> Vec<GraphEditOp> {
    let Some(value) = parse_tolerant(raw) else {
        tracing::debug!(payload = %raw, "graph-edit program parse failed entirely; treating as empty program");
        return Vec::new();
    };

    let entries: Vec<Value> = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("operations") {
            Some(Value::Array(items)) => items.clone(),
            _ if map.is_empty() => Vec::new(),
            _ => vec![value.clone()],
        },
        _ => Vec::new(),
    };

    entries.iter().filter_map(parse_one_op).collect()
}

fn parse_one_op(entry: &Value) -> Option<GraphEditOp> {
    let op_raw = entry.get("op")?.as_str()?;
    let op = normalize_op(op_raw);
    let args = entry.get("args").cloned().unwrap_or(Value::Null);
    let temp_id = entry.get("temp_id").and_then(|v| v.as_str()).map(str::to_string);

    let get_str = |key: &str| args.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let get_f32 = |key: &str| args.get(key).and_then(|v| v.as_f64()).map(|v| v as f32);
    let get_str_array = |key: &str| -> Vec<String> {
        args.get(key)
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };

    match op.as_str() {
        "create_node" => Some(GraphEditOp::CreateNode {
            temp_id,
            content: get_str("content").unwrap_or_default(),
            node_type: NodeType::parse_lenient(&get_str("type").unwrap_or_default()),
        }),
        "create_edge" => Some(GraphEditOp::CreateEdge {
            source_ref: get_str("source_id")?,
            target_ref: get_str("target_id")?,
            edge_type: EdgeType::parse_lenient(&get_str("edge_type").unwrap_or_default()),
            relation_text: get_str("relation_text").unwrap_or_default(),
            importance: get_f32("importance").unwrap_or(0.5).clamp(0.0, 1.0),
        }),
        "update_memory" => Some(GraphEditOp::UpdateMemory {
            memory_id_ref: get_str("memory_id")?,
            importance: get_f32("importance"),
        }),
        "merge_memories" => Some(GraphEditOp::MergeMemories {
            memory_id_refs: get_str_array("memory_ids"),
        }),
        "create_memory" => Some(GraphEditOp::CreateMemory {
            node_refs: get_str_array("node_ids"),
            importance: get_f32("importance").unwrap_or(0.5).clamp(0.0, 1.0),
        }),
        _ => {
            tracing::debug!(op = %op_raw, "unrecognized graph-edit op; dropping");
            None
        }
    }
}

/// Result of executing one program: which nodes were newly created and need
/// a batched embedding (spec.md §4.3 "Embedding batching").
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub created_node_ids: Vec<Uuid>,
    pub created_memory_ids: Vec<Uuid>,
    pub pending_embeddings: Vec<(Uuid, String)>,
}

/// Resolve a reference (temp_id or a literal UUID string) to a real id. A
/// non-string or empty map short-circuits to `None`, per `spec.md` §4.3 step 4.
fn resolve_ref(reference: &str, temp_id_map: &HashMap<String, Uuid>) -> Option<Uuid> {
    if let Some(id) = temp_id_map.get(reference) {
        return Some(*id);
    }
    Uuid::parse_str(reference).ok()
}

/// Execute a parsed program against `scheduler`, resolving `temp_id`s in
/// order. Node creation is applied directly (its embedding is batched
/// separately, see `pending_embeddings`); edges, memory upserts, and memory
/// deletes are queued on the batch scheduler per `spec.md` §4.3 step 5. The
/// scheduler is flushed once at the end so the caller observes the program's
/// full effect immediately, while concurrent callers sharing the same
/// scheduler still get their writes coalesced.
///
/// Edge cases per `spec.md` §4.3 step 6: an edge with an unknown endpoint is
/// dropped and logged; `merge_memories` with a missing target degrades to
/// updating the extant subset; duplicate node ids within one memory collapse.
pub async fn apply_program(ops: &[GraphEditOp], scheduler: &BatchScheduler) -> Result<ApplyResult, GraphStoreError> {
    let store = scheduler.graph();
    let mut temp_id_map: HashMap<String, Uuid> = HashMap::new();
    let mut result = ApplyResult::default();

    for op in ops {
        match op {
            GraphEditOp::CreateNode { temp_id, content, node_type } => {
                let node = Node::new(content.clone(), *node_type);
                let id = node.id;
                if let Some(temp_id) = temp_id {
                    temp_id_map.insert(temp_id.clone(), id);
                }
                result.created_node_ids.push(id);
                result.pending_embeddings.push((id, content.clone()));
                store.upsert_node(node).await?;
            }
            GraphEditOp::CreateEdge { source_ref, target_ref, edge_type, relation_text, importance } => {
                let (Some(source_id), Some(target_id)) =
                    (resolve_ref(source_ref, &temp_id_map), resolve_ref(target_ref, &temp_id_map))
                else {
                    tracing::debug!(%source_ref, %target_ref, "create_edge with unknown endpoint; dropping op");
                    continue;
                };
                let edge = Edge::new(source_id, target_id, *edge_type, relation_text.clone(), *importance);
                scheduler.enqueue(WriteOp::Edge(edge));
            }
            GraphEditOp::UpdateMemory { memory_id_ref, importance } => {
                let Some(memory_id) = resolve_ref(memory_id_ref, &temp_id_map) else {
                    tracing::debug!(%memory_id_ref, "update_memory referencing unknown memory; dropping op");
                    continue;
                };
                if let Some(mut memory) = store.get_memory(memory_id).await? {
                    if let Some(importance) = importance {
                        memory.importance = importance.clamp(0.0, 1.0);
                    }
                    scheduler.enqueue(WriteOp::Memory(memory));
                }
            }
            GraphEditOp::MergeMemories { memory_id_refs } => {
                let mut memories = Vec::new();
                for reference in memory_id_refs {
                    if let Some(id) = resolve_ref(reference, &temp_id_map) {
                        if let Some(memory) = store.get_memory(id).await? {
                            memories.push(memory);
                        }
                    }
                }
                if memories.is_empty() {
                    continue;
                }
                if memories.len() < memory_id_refs.len() {
                    // A target is missing: degrade to an update on the extant
                    // subset rather than merging, per spec.md §4.3 step 6.
                    for memory in memories {
                        scheduler.enqueue(WriteOp::Memory(memory));
                    }
                    continue;
                }
                let original_ids: Vec<Uuid> = memories.iter().map(|m| m.id).collect();
                let merged = merge_memories(memories);
                let merged_id = merged.id;
                scheduler.enqueue(WriteOp::Memory(merged));
                for original_id in original_ids {
                    scheduler.enqueue(WriteOp::DeleteMemory(original_id));
                }
                result.created_memory_ids.push(merged_id);
            }
            GraphEditOp::CreateMemory { node_refs, importance } => {
                let mut node_ids: Vec<Uuid> = Vec::new();
                for reference in node_refs {
                    if let Some(id) = resolve_ref(reference, &temp_id_map) {
                        if !node_ids.contains(&id) {
                            node_ids.push(id);
                        }
                    }
                }
                if node_ids.is_empty() {
                    tracing::debug!("create_memory with no resolvable node_ids; dropping op");
                    continue;
                }
                let memory = Memory::new(node_ids, Vec::new(), *importance, 0.95);
                let id = memory.id;
                scheduler.enqueue(WriteOp::Memory(memory));
                result.created_memory_ids.push(id);
            }
        }
    }

    scheduler.flush_now().await;
    Ok(result)
}

/// Concatenate node/edge lists (deduped), sum `access_count`, keep the
/// maximum `importance`, per `spec.md` §4.3 step 5.
fn merge_memories(memories: Vec<Memory>) -> Memory {
    let mut node_ids = Vec::new();
    let mut edge_ids = Vec::new();
    let mut access_count = 0u64;
    let mut importance = 0.0f32;
    let mut activation = 0.0f32;
    let mut earliest_created = None;

    for memory in &memories {
        for id in &memory.node_ids {
            if !node_ids.contains(id) {
                node_ids.push(*id);
            }
        }
        for id in &memory.edge_ids {
            if !edge_ids.contains(id) {
                edge_ids.push(*id);
            }
        }
        access_count += memory.access_count;
        importance = importance.max(memory.importance);
        activation = activation.max(memory.activation);
        earliest_created = Some(match earliest_created {
            Some(prev) if prev < memory.created_at => prev,
            _ => memory.created_at,
        });
    }

    let mut merged = Memory::new(node_ids, edge_ids, importance, memories[0].decay_factor);
    merged.access_count = access_count;
    merged.activation = activation;
    merged.created_at = earliest_created.unwrap_or(merged.created_at);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_scheduler::BatchSchedulerConfig;
    use crate::long_term::{BruteForceIndex, InMemoryGraphStore, VectorIndex};
    use std::sync::Arc;
    use std::time::Duration;

    fn scheduler(store: Arc<dyn GraphStore>) -> BatchScheduler {
        let vectors: Arc<dyn VectorIndex> = Arc::new(BruteForceIndex::new(4));
        BatchScheduler::spawn(
            store,
            vectors,
            BatchSchedulerConfig { max_batch_size: 1000, flush_interval: Duration::from_secs(3600) },
        )
    }

    /// S3 — Graph program with temp_id.
    #[tokio::test]
    async fn seed_scenario_s3_graph_program_with_temp_id() {
        let raw = r#"[
          {"op":"create_node","temp_id":"t1","args":{"content":"Alice","type":"person"}},
          {"op":"create_node","temp_id":"t2","args":{"content":"likes tea","type":"event"}},
          {"op":"create_edge","args":{"source_id":"t1","target_id":"t2","edge_type":"relation","relation_text":"does","importance":0.6}},
          {"op":"create_memory","args":{"node_ids":["t1","t2"],"importance":0.7}}
        ]"#;
        let ops = parse_program(raw);
        assert_eq!(ops.len(), 4);

        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let scheduler = scheduler(store.clone());
        let result = apply_program(&ops, &scheduler).await.unwrap();

        assert_eq!(result.created_node_ids.len(), 2);
        assert_eq!(result.created_memory_ids.len(), 1);

        let memory = store.get_memory(result.created_memory_ids[0]).await.unwrap().unwrap();
        assert_eq!(memory.node_ids.len(), 2);

        for node_id in &result.created_node_ids {
            assert_eq!(store.get_memories_by_node(*node_id).await.unwrap(), vec![memory.id]);
        }

        let edges = store.get_outgoing_edges(result.created_node_ids[0]).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, result.created_node_ids[1]);
        scheduler.shutdown().await;
    }

    #[test]
    fn empty_object_parses_to_empty_program() {
        assert!(parse_program("{}").is_empty());
    }

    #[test]
    fn object_with_operations_key_is_supported() {
        let raw = r#"{"operations":[{"op":"create_node","args":{"content":"x","type":"entity"}}]}"#;
        assert_eq!(parse_program(raw).len(), 1);
    }

    #[test]
    fn unrecognized_op_is_dropped_not_defaulted() {
        let raw = r#"[{"op":"frobnicate","args":{}}]"#;
        assert!(parse_program(raw).is_empty());
    }

    #[tokio::test]
    async fn create_edge_with_unknown_endpoint_is_dropped() {
        let ops = vec![GraphEditOp::CreateEdge {
            source_ref: "nonexistent".to_string(),
            target_ref: "also-nonexistent".to_string(),
            edge_type: EdgeType::Relation,
            relation_text: "x".to_string(),
            importance: 0.5,
        }];
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let scheduler = scheduler(store);
        let result = apply_program(&ops, &scheduler).await.unwrap();
        assert!(result.created_node_ids.is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn merge_memories_sums_access_count_and_keeps_max_importance() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let n1 = crate::long_term::Node::new("a".to_string(), NodeType::Entity);
        let n2 = crate::long_term::Node::new("b".to_string(), NodeType::Entity);
        store.upsert_node(n1.clone()).await.unwrap();
        store.upsert_node(n2.clone()).await.unwrap();

        let mut m1 = Memory::new(vec![n1.id], vec![], 0.4, 0.95);
        m1.access_count = 3;
        let mut m2 = Memory::new(vec![n2.id], vec![], 0.9, 0.95);
        m2.access_count = 5;
        store.upsert_memory(m1.clone()).await.unwrap();
        store.upsert_memory(m2.clone()).await.unwrap();

        let ops = vec![GraphEditOp::MergeMemories {
            memory_id_refs: vec![m1.id.to_string(), m2.id.to_string()],
        }];
        let scheduler = scheduler(store.clone());
        let result = apply_program(&ops, &scheduler).await.unwrap();
        let merged = store.get_memory(result.created_memory_ids[0]).await.unwrap().unwrap();
        assert_eq!(merged.access_count, 8);
        assert_eq!(merged.importance, 0.9);
        assert_eq!(merged.node_ids.len(), 2);

        // The originals must be gone, or a search would surface the same
        // content two or three times over.
        assert!(store.get_memory(m1.id).await.unwrap().is_none());
        assert!(store.get_memory(m2.id).await.unwrap().is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn merge_memories_is_idempotent_on_replay() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let n1 = crate::long_term::Node::new("a".to_string(), NodeType::Entity);
        let n2 = crate::long_term::Node::new("b".to_string(), NodeType::Entity);
        store.upsert_node(n1.clone()).await.unwrap();
        store.upsert_node(n2.clone()).await.unwrap();
        let m1 = Memory::new(vec![n1.id], vec![], 0.4, 0.95);
        let m2 = Memory::new(vec![n2.id], vec![], 0.9, 0.95);
        store.upsert_memory(m1.clone()).await.unwrap();
        store.upsert_memory(m2.clone()).await.unwrap();

        let ops = vec![GraphEditOp::MergeMemories {
            memory_id_refs: vec![m1.id.to_string(), m2.id.to_string()],
        }];
        let scheduler = scheduler(store.clone());
        let first = apply_program(&ops, &scheduler).await.unwrap();
        assert_eq!(first.created_memory_ids.len(), 1);

        // Replaying the identical program references memory ids that no
        // longer exist, so it resolves to nothing further instead of
        // minting a second merged memory.
        let second = apply_program(&ops, &scheduler).await.unwrap();
        assert!(second.created_memory_ids.is_empty());
        assert_eq!(store.all_memory_ids().await.unwrap().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn merge_memories_with_missing_target_degrades_to_update() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let n1 = crate::long_term::Node::new("a".to_string(), NodeType::Entity);
        store.upsert_node(n1.clone()).await.unwrap();
        let m1 = Memory::new(vec![n1.id], vec![], 0.4, 0.95);
        store.upsert_memory(m1.clone()).await.unwrap();

        let ops = vec![GraphEditOp::MergeMemories {
            memory_id_refs: vec![m1.id.to_string(), Uuid::new_v4().to_string()],
        }];
        let scheduler = scheduler(store.clone());
        let result = apply_program(&ops, &scheduler).await.unwrap();
        assert!(result.created_memory_ids.is_empty());
        assert!(store.get_memory(m1.id).await.unwrap().is_some());
        scheduler.shutdown().await;
    }
}
