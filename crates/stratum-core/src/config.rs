//! Typed configuration surface for the memory engine.
//!
//! This crate does not load configuration itself (no path search, no CLI
//! flags, no env vars) — that belongs to the surrounding application. It
//! only defines the recognized options, with the defaults documented in
//! the engine's external interface contract, as a plain `serde`-friendly
//! struct tree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::long_term::EdgeType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptualConfig {
    pub max_blocks: usize,
    pub block_size: usize,
    pub activation_threshold: u32,
    pub recall_threshold: f32,
}

impl Default for PerceptualConfig {
    fn default() -> Self {
        Self {
            max_blocks: 50,
            block_size: 5,
            activation_threshold: 3,
            recall_threshold: 0.55,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    TransferAll,
    SelectiveCleanup,
}

impl Default for OverflowStrategy {
    fn default() -> Self {
        Self::TransferAll
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortTermConfig {
    pub short_term_max: usize,
    pub transfer_threshold: f32,
    pub overflow_strategy: OverflowStrategy,
    pub enable_force_cleanup: bool,
    pub cleanup_keep_ratio: f32,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            short_term_max: 30,
            transfer_threshold: 0.6,
            overflow_strategy: OverflowStrategy::TransferAll,
            enable_force_cleanup: true,
            cleanup_keep_ratio: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LongTermConfig {
    pub batch_size: usize,
    pub decay_factor: f64,
    pub auto_transfer_interval_secs: u64,
    pub embed_batch_size: usize,
}

impl Default for LongTermConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            decay_factor: 0.95,
            auto_transfer_interval_secs: 180,
            embed_batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub judge_confidence_threshold: f32,
    pub supplemental_query_decay: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.6,
            judge_confidence_threshold: 0.7,
            supplemental_query_decay: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    WeightedGeometric,
    MaxBonus,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::WeightedGeometric
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalScoringWeights {
    pub path: f32,
    pub importance: f32,
    pub recency: f32,
}

impl Default for FinalScoringWeights {
    fn default() -> Self {
        Self {
            path: 0.5,
            importance: 0.3,
            recency: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathExpansionConfig {
    pub max_hops: u32,
    pub damping_factor: f32,
    pub max_branches_per_node: u32,
    pub merge_strategy: MergeStrategy,
    pub pruning_threshold: f32,
    pub edge_type_weights: HashMap<EdgeType, f32>,
    pub final_scoring_weights: FinalScoringWeights,
}

impl Default for PathExpansionConfig {
    fn default() -> Self {
        let mut edge_type_weights = HashMap::new();
        edge_type_weights.insert(EdgeType::CoreRelation, 1.0);
        edge_type_weights.insert(EdgeType::Relation, 0.9);
        edge_type_weights.insert(EdgeType::Attribute, 0.8);
        edge_type_weights.insert(EdgeType::HasProperty, 0.8);
        edge_type_weights.insert(EdgeType::Temporal, 0.7);
        edge_type_weights.insert(EdgeType::Reference, 0.6);
        edge_type_weights.insert(EdgeType::Default, 0.5);
        Self {
            max_hops: 2,
            damping_factor: 0.85,
            max_branches_per_node: 10,
            merge_strategy: MergeStrategy::WeightedGeometric,
            pruning_threshold: 0.3,
            edge_type_weights,
            final_scoring_weights: FinalScoringWeights::default(),
        }
    }
}

/// Timeouts and retry policy for the external gateways, per `spec.md` §5.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub llm_timeout_secs: u64,
    pub llm_max_retry: u32,
    pub llm_max_inflight: usize,
    pub embed_timeout_secs: u64,
    pub embed_max_inflight: usize,
    pub interest_match_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            llm_timeout_secs: 60,
            llm_max_retry: 3,
            llm_max_inflight: 4,
            embed_timeout_secs: 15,
            embed_max_inflight: 8,
            interest_match_timeout_ms: 1_500,
        }
    }
}

/// Top-level configuration surface recognized by the engine.
///
/// This struct is deliberately a plain data holder: loading it from TOML,
/// env vars, or CLI flags is the surrounding application's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub perceptual: PerceptualConfig,
    pub short_term: ShortTermConfig,
    pub long_term: LongTermConfig,
    pub search: SearchConfig,
    pub path_expansion: PathExpansionConfig,
    pub gateway: GatewayConfig,
}
