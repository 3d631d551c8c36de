//! Tier 1 — Perceptual buffer of recent message blocks with
//! activation-based promotion.
//!
//! Grounded on `spec.md` §4.1. Persistence is best-effort append-only per
//! chat (`vestige-core::storage`'s "never mutate already-durable state"
//! philosophy, adapted to a flat JSONL file rather than SQLite since the
//! perceptual tier is explicitly the cheapest, most disposable one).

mod persistence;

pub use persistence::PerceptualStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::PerceptualConfig;
use crate::error::PerceptualError;
use crate::gateways::{cosine_similarity, EmbeddingGateway};

pub type ChatId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Message {
    pub fn new(chat_id: impl Into<String>, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            text: text.into(),
            metadata: HashMap::new(),
            embedding: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub activation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub needs_transfer: bool,
}

impl Block {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            messages: Vec::new(),
            created_at: Utc::now(),
            activation_count: 0,
            embedding: None,
            needs_transfer: false,
        }
    }

    pub fn is_full(&self, block_size: usize) -> bool {
        self.messages.len() >= block_size
    }

    /// Jaccard similarity over whitespace tokens, used as a fallback when no
    /// embedding is available for activation scoring.
    fn lexical_score(&self, query_text: &str) -> f32 {
        let query_tokens: std::collections::HashSet<&str> = query_text.split_whitespace().collect();
        if query_tokens.is_empty() {
            return 0.0;
        }
        let mut best = 0.0f32;
        for msg in &self.messages {
            let msg_tokens: std::collections::HashSet<&str> = msg.text.split_whitespace().collect();
            if msg_tokens.is_empty() {
                continue;
            }
            let intersection = query_tokens.intersection(&msg_tokens).count();
            let union = query_tokens.union(&msg_tokens).count();
            if union > 0 {
                best = best.max(intersection as f32 / union as f32);
            }
        }
        best
    }

    /// `max(cosine(query_embedding, msg_embedding_i))`, falling back to
    /// lexical scoring when no message in the block has an embedding.
    fn activation_score(&self, query_text: &str, query_embedding: Option<&[f32]>) -> f32 {
        if let Some(q) = query_embedding {
            let mut best = None;
            for msg in &self.messages {
                if let Some(emb) = &msg.embedding {
                    let score = cosine_similarity(q, emb);
                    best = Some(best.map_or(score, |b: f32| b.max(score)));
                }
            }
            if let Some(score) = best {
                return score;
            }
        }
        self.lexical_score(query_text)
    }
}

/// Manages per-chat message blocks: accumulation, activation scoring,
/// promotion signaling, and best-effort persistence.
pub struct PerceptualManager {
    config: PerceptualConfig,
    blocks: HashMap<ChatId, Vec<Block>>,
    store: Option<PerceptualStore>,
}

impl PerceptualManager {
    pub fn new(config: PerceptualConfig) -> Self {
        Self {
            config,
            blocks: HashMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: PerceptualStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Append `msg` to the chat's current block, opening a new one if none
    /// exists or the previous one is full. Persistence failures are logged
    /// and swallowed: per `spec.md` §4.1, a crash may lose the tail block but
    /// must never mutate an already-promoted one.
    pub fn add_message(&mut self, chat_id: &str, msg: Message) {
        let chat_blocks = self.blocks.entry(chat_id.to_string()).or_default();
        let needs_new = chat_blocks
            .last()
            .map(|b| b.is_full(self.config.block_size))
            .unwrap_or(true);
        if needs_new {
            if chat_blocks.len() >= self.config.max_blocks {
                // Prefer evicting a block that hasn't yet been flagged for
                // transfer; only fall back to evicting a pending one (and
                // warn) if every block in the chat is already pending.
                let evict_idx = chat_blocks.iter().position(|b| !b.needs_transfer).unwrap_or(0);
                if chat_blocks[evict_idx].needs_transfer {
                    tracing::warn!(
                        %chat_id,
                        "evicting a block still pending short-term transfer; max_blocks exceeded before promotion could run"
                    );
                }
                chat_blocks.remove(evict_idx);
            }
            chat_blocks.push(Block::new(chat_id.to_string()));
        }
        let block = chat_blocks.last_mut().expect("just ensured a block exists");
        block.messages.push(msg);

        if let Some(store) = &self.store {
            if let Err(err) = store.append_block(block) {
                tracing::warn!(%chat_id, %err, "failed to persist perceptual block; continuing in-memory");
            }
        }
    }

    /// Return blocks scoring above `similarity_threshold` against
    /// `query_text`, ordered by descending score. Bumps `activation_count`
    /// on every block that clears `recall_threshold`, and flags
    /// `needs_transfer` once a block's count reaches `activation_threshold`.
    pub fn recall_blocks(
        &mut self,
        chat_id: &str,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Vec<Block> {
        let Some(chat_blocks) = self.blocks.get_mut(chat_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(f32, usize)> = chat_blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.activation_score(query_text, query_embedding), i))
            .filter(|(score, _)| *score >= similarity_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut result = Vec::with_capacity(scored.len());
        for (score, idx) in scored {
            let block = &mut chat_blocks[idx];
            if score >= self.config.recall_threshold {
                block.activation_count += 1;
                if block.activation_count >= self.config.activation_threshold {
                    block.needs_transfer = true;
                }
            }
            result.push(block.clone());
        }
        result
    }

    /// Remove a successfully promoted block.
    pub fn remove_block(&mut self, chat_id: &str, block_id: Uuid) -> Result<(), PerceptualError> {
        if let Some(chat_blocks) = self.blocks.get_mut(chat_id) {
            chat_blocks.retain(|b| b.id != block_id);
        }
        if let Some(store) = &self.store {
            store.remove_block(chat_id, block_id)?;
        }
        Ok(())
    }

    /// All blocks across all chats currently flagged `needs_transfer`.
    pub fn blocks_pending_transfer(&self) -> Vec<Block> {
        self.blocks
            .values()
            .flatten()
            .filter(|b| b.needs_transfer)
            .cloned()
            .collect()
    }
}
