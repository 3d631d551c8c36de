//! `LongTermManager`: transfer from short-term, search, consolidation,
//! decay, and forgetting.
//!
//! Decay-table precomputation and phased background cleanup are grounded on
//! `vestige-core::consolidation::sleep::SleepConsolidation`'s
//! `ConsolidationConfig` (decay/promote/prune knobs with sensible defaults).

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{graph_edit, GraphStore, Memory, Node, VectorIndex};
use crate::batch_scheduler::{BatchScheduler, BatchSchedulerConfig, WriteOp};
use crate::cache::CacheLayer;
use crate::config::LongTermConfig;
use crate::error::LongTermError;
use crate::gateways::{CompletionOptions, EmbeddingGateway, LlmGateway};
use crate::short_term::ShortTermMemory;

/// Outcome of one `transfer_from_short_term` call. Only `transferred_ids`
/// should be cleared from Short-Term, per `spec.md` §4.3 failure semantics.
#[derive(Debug, Default)]
pub struct TransferResult {
    pub transferred_ids: Vec<Uuid>,
    pub failed_ids: Vec<Uuid>,
}

/// Precomputed `decay_factor^k` for `k` in `1..=30`, per `spec.md` §4.3.
fn build_decay_cache(decay_factor: f64) -> [f64; 30] {
    let mut table = [0f64; 30];
    for (k, slot) in table.iter_mut().enumerate() {
        *slot = decay_factor.powi(k as i32 + 1);
    }
    table
}

pub struct LongTermManager {
    config: LongTermConfig,
    llm: Arc<dyn LlmGateway>,
    embedder: Arc<dyn EmbeddingGateway>,
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorIndex>,
    decay_cache: [f64; 30],
    pending_embeddings: tokio::sync::Mutex<Vec<(Uuid, String)>>,
    scheduler: BatchScheduler,
    cache: CacheLayer,
}

impl LongTermManager {
    pub fn new(
        config: LongTermConfig,
        llm: Arc<dyn LlmGateway>,
        embedder: Arc<dyn EmbeddingGateway>,
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        let decay_cache = build_decay_cache(config.decay_factor);
        let scheduler = BatchScheduler::spawn(graph.clone(), vectors.clone(), BatchSchedulerConfig::default());
        Self {
            config,
            llm,
            embedder,
            graph,
            vectors,
            decay_cache,
            pending_embeddings: tokio::sync::Mutex::new(Vec::new()),
            scheduler,
            cache: CacheLayer::default(),
        }
    }

    fn build_transfer_prompt(memory: &ShortTermMemory, similar: &[Memory]) -> String {
        let similar_text: String = similar
            .iter()
            .map(|m| format!("- memory {} (importance={:.2})", m.id, m.importance))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Incorporate this short-term memory into the long-term knowledge graph.\n\
             Short-term record: subject={} topic={} importance={}\n\
             Similar existing long-term memories:\n{similar_text}\n\n\
             Respond with a JSON array of graph-edit operations: \
             create_node, create_edge, update_memory, merge_memories, create_memory.",
            memory.subject, memory.topic, memory.importance
        )
    }

    /// For each short-term memory (bounded concurrency, independent
    /// failures), fetch similar long-term memories, call the LLM for a
    /// graph-edit program, and apply it. Per `spec.md` §4.3 failure
    /// semantics, one failure never aborts the batch.
    pub async fn transfer_from_short_term(&self, batch: Vec<ShortTermMemory>) -> Result<TransferResult, LongTermError> {
        self.flush_pending_embeddings().await?;

        let futures = batch.iter().map(|memory| self.transfer_one(memory));
        let outcomes = join_all(futures).await;

        let mut result = TransferResult::default();
        for (memory, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Ok(()) => result.transferred_ids.push(memory.id),
                Err(err) => {
                    tracing::warn!(memory_id = %memory.id, %err, "long-term transfer failed for this memory; leaving in short-term");
                    result.failed_ids.push(memory.id);
                }
            }
        }
        Ok(result)
    }

    async fn transfer_one(&self, memory: &ShortTermMemory) -> Result<(), LongTermError> {
        let similar = match &memory.embedding {
            Some(embedding) => self.search_by_vector(embedding, self.config.batch_size).await?,
            None => Vec::new(),
        };

        let prompt = Self::build_transfer_prompt(memory, &similar);
        let raw = self
            .llm
            .complete(&prompt, None, &CompletionOptions::default())
            .await?;
        let ops = graph_edit::parse_program(&raw);
        let apply_result = graph_edit::apply_program(&ops, &self.scheduler).await?;
        // A transfer may create, update, or merge memories; any cached
        // query result could now be stale.
        self.cache.invalidate_all_queries();

        if !apply_result.pending_embeddings.is_empty() {
            let mut pending = self.pending_embeddings.lock().await;
            pending.extend(apply_result.pending_embeddings);
            if pending.len() >= self.config.embed_batch_size {
                let batch = std::mem::take(&mut *pending);
                drop(pending);
                self.embed_and_index(batch).await?;
            }
        }
        Ok(())
    }

    async fn search_by_vector(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Memory>, LongTermError> {
        let neighbors = self.vectors.query(embedding, top_k).await?;
        let mut memories = Vec::new();
        for (node_id, _score) in neighbors {
            for memory_id in self.graph.get_memories_by_node(node_id).await? {
                if let Some(memory) = self.graph.get_memory(memory_id).await? {
                    memories.push(memory);
                }
            }
        }
        Ok(memories)
    }

    /// Flush queued `(node_id, content)` pairs: batched embed, bulk-insert
    /// into the vector index. Triggered by queue-length, by a search about
    /// to run, or by shutdown (spec.md §4.3).
    pub async fn flush_pending_embeddings(&self) -> Result<(), LongTermError> {
        let mut pending = self.pending_embeddings.lock().await;
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut *pending);
        drop(pending);
        self.embed_and_index(batch).await
    }

    /// Node embedding updates and vector-index upserts both go through the
    /// batch scheduler per `spec.md` §5's shared-resource policy for the
    /// vector index. The scheduler is flushed before returning so a search
    /// that follows immediately sees these writes.
    async fn embed_and_index(&self, batch: Vec<(Uuid, String)>) -> Result<(), LongTermError> {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        for ((node_id, _), vector) in batch.into_iter().zip(vectors) {
            if let Some(mut node) = self.graph.get_node(node_id).await? {
                node.embedding = Some(vector.clone());
                self.scheduler.enqueue(WriteOp::Node(node));
                self.cache.invalidate_node(&node_id);
            }
            self.scheduler.enqueue(WriteOp::VectorUpsert(node_id, vector));
        }
        self.scheduler.flush_now().await;
        Ok(())
    }

    /// Vector TopK of nodes mapped to candidate memories via the
    /// node→memories index. Path expansion and final ranking are layered on
    /// top by `crate::path_expansion`; this is the raw candidate fetch.
    pub async fn search_memories(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<(Node, f32)>, LongTermError> {
        self.flush_pending_embeddings().await?;
        let neighbors = self.vectors.query(query_embedding, top_k).await?;
        let mut out = Vec::with_capacity(neighbors.len());
        for (node_id, score) in neighbors {
            if let Some(node) = self.fetch_node(node_id).await? {
                out.push((node, score));
            }
        }
        Ok(out)
    }

    /// Node lookup through the cache layer, falling back to the graph store
    /// on a miss and populating the cache with the result.
    async fn fetch_node(&self, node_id: Uuid) -> Result<Option<Node>, LongTermError> {
        if let Some(node) = self.cache.get_node(&node_id) {
            return Ok(Some(node));
        }
        let node = self.graph.get_node(node_id).await?;
        if let Some(node) = &node {
            self.cache.put_node(node.clone());
        }
        Ok(node)
    }

    /// Cached rank-ordered memories for a previously seen query string, used
    /// by the coordinator's multi-query merge to skip a repeated
    /// expand-and-rank round trip (spec.md §5 cache layer).
    pub fn cached_query(&self, query_text: &str) -> Option<Vec<Memory>> {
        self.cache.get_query(query_text)
    }

    pub fn cache_query(&self, query_text: String, ranked_memories: Vec<Memory>) {
        self.cache.put_query(query_text, ranked_memories);
    }

    /// Flush whatever the batch scheduler has queued, bypassing its timer.
    /// Called during coordinator shutdown so no write is left stranded.
    pub async fn flush_scheduler(&self) {
        self.scheduler.flush_now().await;
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.vectors
    }

    /// `days = floor((now - last_accessed)/86400)`; `activation *= decay_cache[clamp(days,1,30)]`,
    /// falling back to `pow` beyond 30 days. Idempotent for a fixed `now`.
    /// Only changed memories are written, and only through the batch
    /// scheduler, per `spec.md` §4.3's decay paragraph.
    pub async fn apply_decay(&self, now: DateTime<Utc>) -> Result<(), LongTermError> {
        let mut changed = false;
        for memory_id in self.graph.all_memory_ids().await? {
            let Some(mut memory) = self.graph.get_memory(memory_id).await? else { continue };
            let days = (now - memory.last_accessed_at).num_seconds().max(0) / 86_400;
            let factor = if days == 0 {
                continue; // no elapsed day: no-op, keeps apply_decay(t); apply_decay(t) stable.
            } else if days <= 30 {
                self.decay_cache[(days - 1).clamp(0, 29) as usize]
            } else {
                self.config.decay_factor.powi(days as i32)
            };
            let new_activation = (memory.activation as f64 * factor) as f32;
            if (new_activation - memory.activation).abs() > f32::EPSILON {
                memory.activation = new_activation;
                self.scheduler.enqueue(WriteOp::Memory(memory));
                changed = true;
            }
        }
        if changed {
            self.scheduler.flush_now().await;
            self.cache.invalidate_all_queries();
        }
        Ok(())
    }

    /// Delete memories below `activation_threshold` unless their importance
    /// is at or above `importance_floor` (importance acts as protection).
    pub async fn forget(&self, activation_threshold: f32, importance_floor: f32) -> Result<Vec<Uuid>, LongTermError> {
        let mut forgotten = Vec::new();
        for memory_id in self.graph.all_memory_ids().await? {
            if let Some(memory) = self.graph.get_memory(memory_id).await? {
                if memory.activation < activation_threshold && memory.importance < importance_floor {
                    self.graph.delete_memory(memory_id).await?;
                    forgotten.push(memory_id);
                }
            }
        }
        if !forgotten.is_empty() {
            self.cache.invalidate_all_queries();
        }
        Ok(forgotten)
    }

    /// Background cleanup: merge near-duplicate nodes (same content,
    /// case-insensitive) and rebuild the node→memories index along the way
    /// by re-upserting every memory unchanged (a no-op rebuild, since the
    /// in-memory/sqlite stores keep the index live on every upsert).
    pub async fn consolidate(&self) -> Result<usize, LongTermError> {
        let node_ids = self.graph.all_node_ids().await?;
        let mut by_content: HashMap<String, Vec<Uuid>> = HashMap::new();
        for id in node_ids {
            if let Some(node) = self.graph.get_node(id).await? {
                by_content.entry(node.content.to_lowercase()).or_default().push(id);
            }
        }

        let mut merges = 0usize;
        for (_, mut ids) in by_content {
            if ids.len() < 2 {
                continue;
            }
            ids.sort();
            let canonical = ids[0];
            for duplicate in &ids[1..] {
                self.repoint_edges_and_memories(*duplicate, canonical).await?;
                merges += 1;
            }
        }
        if merges > 0 {
            self.cache.invalidate_all_queries();
        }
        Ok(merges)
    }

    async fn repoint_edges_and_memories(&self, from: Uuid, to: Uuid) -> Result<(), LongTermError> {
        for edge in self.graph.get_outgoing_edges(from).await? {
            let mut edge = edge;
            edge.source_id = to;
            self.graph.upsert_edge(edge).await?;
        }
        for edge in self.graph.get_incoming_edges(from).await? {
            let mut edge = edge;
            edge.target_id = to;
            self.graph.upsert_edge(edge).await?;
        }
        for memory_id in self.graph.get_memories_by_node(from).await? {
            if let Some(mut memory) = self.graph.get_memory(memory_id).await? {
                memory.node_ids.retain(|id| *id != from);
                if !memory.node_ids.contains(&to) {
                    memory.node_ids.push(to);
                }
                self.graph.upsert_memory(memory).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::{DeterministicEmbeddingGateway, MockLlmGateway};
    use crate::long_term::{BruteForceIndex, InMemoryGraphStore, NodeType};
    use crate::short_term::MemoryType;
    use chrono::Duration;

    fn manager(responses: Vec<&str>) -> LongTermManager {
        let llm = Arc::new(MockLlmGateway::new(responses.into_iter().map(String::from)));
        let embedder = Arc::new(DeterministicEmbeddingGateway::new(16));
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let vectors: Arc<dyn VectorIndex> = Arc::new(BruteForceIndex::new(16));
        LongTermManager::new(LongTermConfig::default(), llm, embedder, graph, vectors)
    }

    #[tokio::test]
    async fn transfer_from_short_term_applies_program_and_reports_transferred() {
        let raw = r#"[{"op":"create_node","temp_id":"t1","args":{"content":"Alice","type":"person"}},
                       {"op":"create_memory","args":{"node_ids":["t1"],"importance":0.6}}]"#;
        let mgr = manager(vec![raw]);
        let mut m = ShortTermMemory::new("chat-1", "alice", MemoryType::Fact, "likes tea");
        m.embedding = Some(vec![0.0; 16]);

        let result = mgr.transfer_from_short_term(vec![m.clone()]).await.unwrap();
        assert_eq!(result.transferred_ids, vec![m.id]);
        assert!(result.failed_ids.is_empty());
    }

    #[tokio::test]
    async fn decay_is_idempotent_for_same_timestamp() {
        let mgr = manager(vec![]);
        let node = Node::new("x".to_string(), NodeType::Entity);
        mgr.graph.upsert_node(node.clone()).await.unwrap();
        let mut memory = Memory::new(vec![node.id], vec![], 0.5, 0.95);
        memory.last_accessed_at = Utc::now() - Duration::days(5);
        mgr.graph.upsert_memory(memory.clone()).await.unwrap();

        let now = Utc::now();
        mgr.apply_decay(now).await.unwrap();
        let after_first = mgr.graph.get_memory(memory.id).await.unwrap().unwrap().activation;
        mgr.apply_decay(now).await.unwrap();
        let after_second = mgr.graph.get_memory(memory.id).await.unwrap().unwrap().activation;
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn decay_reduces_activation_monotonically_with_elapsed_days() {
        let mgr = manager(vec![]);
        let node = Node::new("x".to_string(), NodeType::Entity);
        mgr.graph.upsert_node(node.clone()).await.unwrap();
        let mut memory = Memory::new(vec![node.id], vec![], 0.5, 0.95);
        memory.activation = 1.0;
        memory.last_accessed_at = Utc::now() - Duration::days(10);
        mgr.graph.upsert_memory(memory.clone()).await.unwrap();

        mgr.apply_decay(Utc::now()).await.unwrap();
        let decayed = mgr.graph.get_memory(memory.id).await.unwrap().unwrap().activation;
        assert!(decayed < 1.0);
    }

    #[tokio::test]
    async fn forget_removes_low_activation_low_importance_memories() {
        let mgr = manager(vec![]);
        let node = Node::new("x".to_string(), NodeType::Entity);
        mgr.graph.upsert_node(node.clone()).await.unwrap();
        let mut memory = Memory::new(vec![node.id], vec![], 0.1, 0.95);
        memory.activation = 0.01;
        mgr.graph.upsert_memory(memory.clone()).await.unwrap();

        let forgotten = mgr.forget(0.1, 0.3).await.unwrap();
        assert_eq!(forgotten, vec![memory.id]);
        assert!(mgr.graph.get_memory(memory.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forget_protects_high_importance_memories() {
        let mgr = manager(vec![]);
        let node = Node::new("x".to_string(), NodeType::Entity);
        mgr.graph.upsert_node(node.clone()).await.unwrap();
        let mut memory = Memory::new(vec![node.id], vec![], 0.9, 0.95);
        memory.activation = 0.01;
        mgr.graph.upsert_memory(memory.clone()).await.unwrap();

        let forgotten = mgr.forget(0.1, 0.3).await.unwrap();
        assert!(forgotten.is_empty());
    }

    #[tokio::test]
    async fn consolidate_merges_nodes_with_identical_content() {
        let mgr = manager(vec![]);
        let n1 = Node::new("alice".to_string(), NodeType::Person);
        let n2 = Node::new("Alice".to_string(), NodeType::Person);
        mgr.graph.upsert_node(n1.clone()).await.unwrap();
        mgr.graph.upsert_node(n2.clone()).await.unwrap();
        let memory = Memory::new(vec![n2.id], vec![], 0.5, 0.95);
        mgr.graph.upsert_memory(memory.clone()).await.unwrap();

        let merges = mgr.consolidate().await.unwrap();
        assert_eq!(merges, 1);
        let updated = mgr.graph.get_memory(memory.id).await.unwrap().unwrap();
        let canonical = n1.id.min(n2.id);
        assert!(updated.node_ids.contains(&canonical));
    }
}
