//! `ShortTermManager`: LLM-guided mutation of the short-term memory set,
//! similarity-matrix caching, and overflow policy.

use std::sync::Arc;
use uuid::Uuid;

use super::{Decision, DecisionOp, MemoryFields, MemoryType, ShortTermMemory, ShortTermSnapshot};
use crate::config::{OverflowStrategy, ShortTermConfig};
use crate::error::ShortTermError;
use crate::gateways::{cosine_similarity, CompletionOptions, EmbeddingGateway, LlmGateway};
use crate::perceptual::Block;

/// In-memory similarity matrix over the current memory set, invalidated on
/// any create/merge/update/delete per `spec.md` §4.2.
struct SimilarityCache {
    valid: bool,
}

impl SimilarityCache {
    fn new() -> Self {
        Self { valid: false }
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }
}

pub struct ShortTermManager {
    config: ShortTermConfig,
    llm: Arc<dyn LlmGateway>,
    embedder: Arc<dyn EmbeddingGateway>,
    memories: Vec<ShortTermMemory>,
    similarity_cache: SimilarityCache,
    store: Option<ShortTermSnapshot>,
}

impl ShortTermManager {
    pub fn new(config: ShortTermConfig, llm: Arc<dyn LlmGateway>, embedder: Arc<dyn EmbeddingGateway>) -> Self {
        Self {
            config,
            llm,
            embedder,
            memories: Vec::new(),
            similarity_cache: SimilarityCache::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: ShortTermSnapshot) -> Self {
        self.store = Some(store);
        self
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// `occupancy = len / short_term_max`, used by the coordinator's
    /// auto-transfer loop (`spec.md` §4.5).
    pub fn occupancy(&self) -> f32 {
        self.memories.len() as f32 / self.config.short_term_max.max(1) as f32
    }

    fn build_prompt(&self, block: &Block, simplified: bool) -> String {
        let existing_summary: String = if simplified {
            format!("{} existing memories for this chat.", self.memories.len())
        } else {
            self.memories
                .iter()
                .filter(|m| m.chat_id == block.chat_id)
                .map(|m| format!("- [{}] {} {} (importance={:.2})", m.id, m.subject, m.topic, m.importance))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let block_text: String = block
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.sender_id, m.text))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are deciding how to incorporate a new block of chat messages into short-term memory.\n\
             Existing memories:\n{existing_summary}\n\n\
             New block:\n{block_text}\n\n\
             Respond with JSON: {{\"op\": \"create_new\"|\"merge\"|\"update\"|\"discard\", \"target_id\"?: string, \
             \"memory_fields\"?: object, \"reasoning\": string}}"
        )
    }

    /// Run one LLM call deciding how to incorporate `block`. Retries once
    /// with a simplified prompt on gateway failure; persistent failure
    /// returns `Ok(None)` so the caller leaves the block in Perceptual for
    /// later retry, per `spec.md` §4.2 failure semantics.
    pub async fn add_from_block(&mut self, block: &Block) -> Result<Option<ShortTermMemory>, ShortTermError> {
        let opts = CompletionOptions::default();
        let prompt = self.build_prompt(block, false);
        let raw = match self.llm.complete(&prompt, None, &opts).await {
            Ok(raw) => raw,
            Err(first_err) => {
                tracing::warn!(%first_err, "short-term LLM call failed; retrying with simplified prompt");
                let simplified_prompt = self.build_prompt(block, true);
                self.llm.complete(&simplified_prompt, None, &opts).await?
            }
        };

        let decision = Decision::parse(&raw);
        self.apply_decision(block, decision).await
    }

    async fn apply_decision(&mut self, block: &Block, decision: Decision) -> Result<Option<ShortTermMemory>, ShortTermError> {
        match decision.op {
            DecisionOp::Discard => {
                tracing::info!(block_id = %block.id, reasoning = %decision.reasoning, "short-term decision: discard");
                Ok(None)
            }
            DecisionOp::CreateNew => {
                let fields = decision.memory_fields.unwrap_or_default();
                let memory = self.create_from_fields(block, fields).await?;
                self.memories.push(memory.clone());
                self.similarity_cache.invalidate();
                Ok(Some(memory))
            }
            DecisionOp::Update => {
                let target_id = decision.target_id.expect("Decision::parse guarantees target_id for Update");
                let fields = decision.memory_fields.unwrap_or_default();
                match self.memories.iter_mut().find(|m| m.id == target_id) {
                    Some(existing) => {
                        apply_fields(existing, &fields);
                        existing.embedding = None;
                        existing.source_block_ids.push(block.id);
                        let updated = existing.clone();
                        self.similarity_cache.invalidate();
                        Ok(Some(updated))
                    }
                    None => {
                        let memory = self.create_from_fields(block, fields).await?;
                        self.memories.push(memory.clone());
                        self.similarity_cache.invalidate();
                        Ok(Some(memory))
                    }
                }
            }
            DecisionOp::Merge => {
                let target_id = decision.target_id.expect("Decision::parse guarantees target_id for Merge");
                let fields = decision.memory_fields.unwrap_or_default();
                match self.memories.iter_mut().find(|m| m.id == target_id) {
                    Some(existing) => {
                        apply_fields(existing, &fields);
                        existing.embedding = None;
                        existing.source_block_ids.push(block.id);
                        existing.importance = existing.importance.max(fields.importance.unwrap_or(0.0));
                        let updated = existing.clone();
                        self.similarity_cache.invalidate();
                        Ok(Some(updated))
                    }
                    None => {
                        let memory = self.create_from_fields(block, fields).await?;
                        self.memories.push(memory.clone());
                        self.similarity_cache.invalidate();
                        Ok(Some(memory))
                    }
                }
            }
        }
    }

    async fn create_from_fields(&self, block: &Block, fields: MemoryFields) -> Result<ShortTermMemory, ShortTermError> {
        let memory_type = fields
            .memory_type
            .as_deref()
            .map(MemoryType::parse_lenient)
            .unwrap_or(MemoryType::Other);
        let mut memory = ShortTermMemory::new(
            block.chat_id.clone(),
            fields.subject.unwrap_or_default(),
            memory_type,
            fields.topic.unwrap_or_default(),
        );
        memory.object = fields.object;
        memory.attributes = fields.attributes;
        memory.importance = fields.importance.unwrap_or(0.5).clamp(0.0, 1.0);
        memory.source_block_ids = vec![block.id];

        // Embedding failures mark the memory with no embedding; it remains
        // searchable via the lexical fallback (spec.md §4.2 failure semantics).
        match self.embedder.embed(&format!("{} {}", memory.subject, memory.topic)).await {
            Ok(v) => memory.embedding = Some(v),
            Err(err) => tracing::warn!(%err, "embedding failed for new short-term memory; will use lexical fallback"),
        }
        Ok(memory)
    }

    /// Lazily re-embeds any memory missing a vector, then scores by cosine
    /// (falling back to Jaccard lexical overlap for any memory the embedder
    /// still couldn't produce a vector for).
    pub async fn search_memories(&mut self, query: &str, top_k: usize) -> Vec<ShortTermMemory> {
        let missing: Vec<usize> = self
            .memories
            .iter()
            .enumerate()
            .filter(|(_, m)| m.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| format!("{} {}", self.memories[i].subject, self.memories[i].topic)).collect();
            if let Ok(vectors) = self.embedder.embed_batch(&texts).await {
                for (slot, vector) in missing.into_iter().zip(vectors) {
                    self.memories[slot].embedding = Some(vector);
                }
            }
        }

        let query_embedding = self.embedder.embed(query).await.ok();
        let mut scored: Vec<(f32, usize)> = self
            .memories
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let score = match (&query_embedding, &m.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => jaccard(query, &format!("{} {}", m.subject, m.topic)),
                };
                (score, i)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored.into_iter().map(|(_, i)| self.memories[i].clone()).collect()
    }

    /// Candidates for promotion per the configured overflow strategy.
    /// `transfer_all` promotes the whole set; `selective_cleanup` promotes
    /// only memories at or above `transfer_threshold`.
    pub fn get_memories_for_transfer(&self) -> Vec<ShortTermMemory> {
        match self.config.overflow_strategy {
            OverflowStrategy::TransferAll => self.memories.clone(),
            OverflowStrategy::SelectiveCleanup => self
                .memories
                .iter()
                .filter(|m| m.importance >= self.config.transfer_threshold)
                .cloned()
                .collect(),
        }
    }

    /// Remove transferred memories, then apply whatever cleanup the
    /// overflow strategy and force-cleanup flag call for.
    pub fn clear_transferred(&mut self, ids: &[Uuid]) {
        self.memories.retain(|m| !ids.contains(&m.id));
        self.similarity_cache.invalidate();

        match self.config.overflow_strategy {
            OverflowStrategy::TransferAll => {
                // After a full-set transfer, delete anything below the
                // transfer threshold that the batch somehow left behind
                // (e.g. partial failure).
                self.memories.retain(|m| m.importance >= self.config.transfer_threshold);
            }
            OverflowStrategy::SelectiveCleanup => {
                // Low-importance memories were never selected for transfer;
                // delete them here rather than leaving them to accumulate.
                self.memories.retain(|m| m.importance >= self.config.transfer_threshold);
            }
        }

        if self.config.enable_force_cleanup {
            self.apply_pressure_relief();
        }
        self.similarity_cache.invalidate();
    }

    /// Delete the lowest `(importance, created_at)` entries down to
    /// `floor(max * keep_ratio)` when over capacity.
    fn apply_pressure_relief(&mut self) {
        let max = self.config.short_term_max;
        let keep = (max as f32 * self.config.cleanup_keep_ratio).floor() as usize;
        if self.memories.len() <= keep {
            return;
        }
        let to_remove = self.memories.len() - keep;
        let mut ranked: Vec<usize> = (0..self.memories.len()).collect();
        ranked.sort_by(|&a, &b| {
            let ma = &self.memories[a];
            let mb = &self.memories[b];
            ma.importance
                .partial_cmp(&mb.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ma.created_at.cmp(&mb.created_at))
        });
        let remove_set: std::collections::HashSet<Uuid> =
            ranked.into_iter().take(to_remove).map(|i| self.memories[i].id).collect();
        self.memories.retain(|m| !remove_set.contains(&m.id));
    }

    /// Persist the current snapshot (without embeddings) atomically.
    pub fn persist(&self) -> Result<(), ShortTermError> {
        if let Some(store) = &self.store {
            store.write(&self.memories)?;
        }
        Ok(())
    }
}

fn apply_fields(existing: &mut ShortTermMemory, fields: &MemoryFields) {
    if let Some(subject) = &fields.subject {
        existing.subject = subject.clone();
    }
    if let Some(memory_type) = &fields.memory_type {
        existing.memory_type = MemoryType::parse_lenient(memory_type);
    }
    if let Some(topic) = &fields.topic {
        existing.topic = topic.clone();
    }
    if fields.object.is_some() {
        existing.object = fields.object.clone();
    }
    for (k, v) in &fields.attributes {
        existing.attributes.insert(k.clone(), v.clone());
    }
    if let Some(importance) = fields.importance {
        existing.importance = importance.clamp(0.0, 1.0);
    }
}

fn jaccard(a: &str, b: &str) -> f32 {
    let ta: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let tb: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::{DeterministicEmbeddingGateway, MockLlmGateway};
    use crate::perceptual::Message;

    fn block_with_text(chat_id: &str, text: &str) -> Block {
        let mut mgr = crate::perceptual::PerceptualManager::new(crate::config::PerceptualConfig {
            max_blocks: 10,
            block_size: 5,
            activation_threshold: 3,
            recall_threshold: 0.0,
        });
        mgr.add_message(chat_id, Message::new(chat_id, "u1", text));
        mgr.recall_blocks(chat_id, text, None, 10, 0.0).remove(0)
    }

    fn manager_with_responses(responses: Vec<&str>) -> ShortTermManager {
        let llm = Arc::new(MockLlmGateway::new(responses.into_iter().map(String::from)));
        let embedder = Arc::new(DeterministicEmbeddingGateway::new(32));
        ShortTermManager::new(ShortTermConfig::default(), llm, embedder)
    }

    #[tokio::test]
    async fn add_from_block_creates_new_memory() {
        let mut mgr = manager_with_responses(vec![
            r#"{"op":"create_new","memory_fields":{"subject":"alice","topic":"likes tea","memory_type":"fact","importance":0.8}}"#,
        ]);
        let block = block_with_text("chat-1", "alice likes tea");
        let memory = mgr.add_from_block(&block).await.unwrap().unwrap();
        assert_eq!(memory.subject, "alice");
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn add_from_block_honors_discard() {
        let mut mgr = manager_with_responses(vec![r#"{"op":"discard","reasoning":"noise"}"#]);
        let block = block_with_text("chat-1", "lol");
        let memory = mgr.add_from_block(&block).await.unwrap();
        assert!(memory.is_none());
        assert_eq!(mgr.len(), 0);
    }

    #[tokio::test]
    async fn search_memories_returns_closest_by_cosine() {
        let mut mgr = manager_with_responses(vec![
            r#"{"op":"create_new","memory_fields":{"subject":"alice","topic":"likes tea"}}"#,
            r#"{"op":"create_new","memory_fields":{"subject":"bob","topic":"plays guitar"}}"#,
        ]);
        let b1 = block_with_text("chat-1", "alice likes tea");
        let b2 = block_with_text("chat-1", "bob plays guitar");
        mgr.add_from_block(&b1).await.unwrap();
        mgr.add_from_block(&b2).await.unwrap();

        let results = mgr.search_memories("alice tea", 1).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].subject, "alice");
    }

    /// S5 — Overflow `transfer_all` vs `selective_cleanup`.
    #[test]
    fn seed_scenario_s5_transfer_all() {
        let llm = Arc::new(MockLlmGateway::new(std::iter::empty()));
        let embedder = Arc::new(DeterministicEmbeddingGateway::new(8));
        let mut config = ShortTermConfig::default();
        config.short_term_max = 30;
        config.overflow_strategy = OverflowStrategy::TransferAll;
        config.enable_force_cleanup = false;
        let mut mgr = ShortTermManager::new(config, llm, embedder);

        for i in 0..20 {
            let mut m = ShortTermMemory::new("chat-1", format!("s{i}"), MemoryType::Fact, "t");
            m.importance = 0.8;
            mgr.memories.push(m);
        }
        for i in 0..10 {
            let mut m = ShortTermMemory::new("chat-1", format!("low{i}"), MemoryType::Fact, "t");
            m.importance = 0.3;
            mgr.memories.push(m);
        }
        assert_eq!(mgr.len(), 30);

        let batch = mgr.get_memories_for_transfer();
        assert_eq!(batch.len(), 30);
        let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
        mgr.clear_transferred(&ids);
        assert_eq!(mgr.len(), 20);
    }

    #[test]
    fn seed_scenario_s5_selective_cleanup() {
        let llm = Arc::new(MockLlmGateway::new(std::iter::empty()));
        let embedder = Arc::new(DeterministicEmbeddingGateway::new(8));
        let mut config = ShortTermConfig::default();
        config.short_term_max = 30;
        config.overflow_strategy = OverflowStrategy::SelectiveCleanup;
        config.enable_force_cleanup = false;
        let mut mgr = ShortTermManager::new(config, llm, embedder);

        for i in 0..20 {
            let mut m = ShortTermMemory::new("chat-1", format!("s{i}"), MemoryType::Fact, "t");
            m.importance = 0.8;
            mgr.memories.push(m);
        }
        for i in 0..10 {
            let mut m = ShortTermMemory::new("chat-1", format!("low{i}"), MemoryType::Fact, "t");
            m.importance = 0.3;
            mgr.memories.push(m);
        }

        let batch = mgr.get_memories_for_transfer();
        assert_eq!(batch.len(), 20);
        let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
        mgr.clear_transferred(&ids);
        assert_eq!(mgr.len(), 20);
    }

    #[test]
    fn pressure_relief_keeps_ratio_and_prefers_importance() {
        let llm = Arc::new(MockLlmGateway::new(std::iter::empty()));
        let embedder = Arc::new(DeterministicEmbeddingGateway::new(8));
        let mut config = ShortTermConfig::default();
        config.short_term_max = 10;
        config.cleanup_keep_ratio = 0.9;
        config.enable_force_cleanup = true;
        let mut mgr = ShortTermManager::new(config, llm, embedder);
        for i in 0..10 {
            let mut m = ShortTermMemory::new("chat-1", format!("s{i}"), MemoryType::Fact, "t");
            m.importance = if i == 0 { 0.01 } else { 0.9 };
            mgr.memories.push(m);
        }
        mgr.apply_pressure_relief();
        assert_eq!(mgr.len(), 9);
        assert!(mgr.memories.iter().all(|m| m.importance > 0.01));
    }
}
