//! Path Expansion Engine: multi-hop scored graph walk used during
//! long-term retrieval (`spec.md` §4.4).
//!
//! Pure in-memory algorithm over whatever [`crate::long_term::GraphStore`]
//! is configured; the weighted-merge idiom in the final scoring step is
//! grounded on `vestige-core::search::hybrid::linear_combination`.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::config::{FinalScoringWeights, MergeStrategy, PathExpansionConfig};
use crate::error::LongTermError;
use crate::gateways::cosine_similarity;
use crate::long_term::{EdgeType, GraphStore, Memory, Node};

/// One partial path during expansion.
#[derive(Debug, Clone)]
struct Path {
    nodes: Vec<Uuid>,
    score: f32,
    depth: u32,
}

/// Seed entry from the Vector Index TopK.
#[derive(Debug, Clone)]
pub struct SeedNode {
    pub node_id: Uuid,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ExpansionRequest<'a> {
    pub preferred_types: Option<&'a HashSet<Uuid>>,
}

fn type_weight(config: &PathExpansionConfig, edge_type: EdgeType) -> f32 {
    config.edge_type_weights.get(&edge_type).copied().unwrap_or(0.5)
}

fn merge_scores(strategy: MergeStrategy, a: f32, b: f32) -> f32 {
    match strategy {
        // spec.md §9 fixes the bonus pair (1.2, 1.3); do not reinterpret.
        MergeStrategy::WeightedGeometric => (a * b).max(0.0).sqrt() * 1.2,
        MergeStrategy::MaxBonus => a.max(b) * 1.3,
    }
}

/// Run the multi-hop walk from `seeds`, scoring against `query_embedding`.
/// Returns, per node reached, the best path score achieved
/// (`best_score_to_node`), which is monotone non-decreasing within one call
/// (`spec.md` §8 property 5).
pub async fn expand(
    graph: &dyn GraphStore,
    config: &PathExpansionConfig,
    seeds: &[SeedNode],
    query_embedding: Option<&[f32]>,
    node_embeddings: &HashMap<Uuid, Vec<f32>>,
    request: &ExpansionRequest<'_>,
) -> Result<HashMap<Uuid, f32>, LongTermError> {
    let mut best_score_to_node: HashMap<Uuid, f32> = HashMap::new();
    let mut active: Vec<Path> = Vec::new();

    for seed in seeds {
        best_score_to_node
            .entry(seed.node_id)
            .and_modify(|s| *s = s.max(seed.score))
            .or_insert(seed.score);
        active.push(Path {
            nodes: vec![seed.node_id],
            score: seed.score,
            depth: 0,
        });
    }

    let mut previous_count = active.len();

    for depth in 1..=config.max_hops {
        let mut next: Vec<Path> = Vec::new();
        let mut this_hop_best: HashMap<Uuid, Path> = HashMap::new();

        for path in &active {
            let terminal = *path.nodes.last().expect("a path always has a terminal node");
            let mut edges = graph.get_outgoing_edges(terminal).await?;
            edges.sort_by(|a, b| {
                let wa = a.importance * type_weight(config, a.edge_type);
                let wb = b.importance * type_weight(config, b.edge_type);
                wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
            });

            let branch_budget = ((config.max_branches_per_node as f32) * (0.5 + 0.5 * path.score)).floor().max(1.0) as usize;

            for edge in edges.into_iter().take(branch_budget) {
                let u = edge.target_id;
                if path.nodes.contains(&u) {
                    continue;
                }

                let w_edge = edge.importance * type_weight(config, edge.edge_type);
                let mut s_node = match (query_embedding, node_embeddings.get(&u)) {
                    (Some(q), Some(emb)) => cosine_similarity(q, emb),
                    _ => 0.3,
                };
                if let Some(preferred) = request.preferred_types {
                    if preferred.contains(&u) {
                        s_node *= 1.2;
                    }
                }
                let delta = config.damping_factor.powi(depth as i32);
                let new_score = path.score * w_edge * delta + s_node * (1.0 - delta);

                let mut new_path = Path {
                    nodes: {
                        let mut n = path.nodes.clone();
                        n.push(u);
                        n
                    },
                    score: new_score,
                    depth,
                };

                if let Some(existing) = this_hop_best.get(&u) {
                    if (new_path.score - existing.score).abs() < 0.1 {
                        new_path.score = merge_scores(config.merge_strategy, new_path.score, existing.score);
                    }
                }
                this_hop_best
                    .entry(u)
                    .and_modify(|p| {
                        if new_path.score > p.score {
                            *p = new_path.clone();
                        }
                    })
                    .or_insert(new_path.clone());

                best_score_to_node
                    .entry(u)
                    .and_modify(|s| *s = s.max(new_path.score))
                    .or_insert(new_path.score);
            }
        }

        next.extend(this_hop_best.into_values());

        if next.is_empty() {
            break;
        }
        let max_score = next.iter().map(|p| p.score).fold(f32::MIN, f32::max);
        next.retain(|p| p.score >= config.pruning_threshold * max_score);

        let growth = if previous_count == 0 { 1.0 } else { next.len() as f32 / previous_count as f32 - 1.0 };
        active = next;
        previous_count = active.len();
        if growth < 0.1 {
            break;
        }
    }

    Ok(best_score_to_node)
}

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub final_score: f32,
}

/// Aggregate `best_score_to_node` into per-memory final scores: rank-weighted
/// mean of contributing path scores as `path_score`, combined with
/// importance and a created/accessed recency term.
pub async fn rank_memories(
    graph: &dyn GraphStore,
    weights: &FinalScoringWeights,
    best_score_to_node: &HashMap<Uuid, f32>,
    top_k: usize,
) -> Result<Vec<ScoredMemory>, LongTermError> {
    let mut memory_path_scores: HashMap<Uuid, Vec<f32>> = HashMap::new();

    for (&node_id, &score) in best_score_to_node {
        for memory_id in graph.get_memories_by_node(node_id).await? {
            memory_path_scores.entry(memory_id).or_default().push(score);
        }
    }

    let mut out = Vec::with_capacity(memory_path_scores.len());
    for (memory_id, mut scores) in memory_path_scores {
        let Some(memory) = graph.get_memory(memory_id).await? else { continue };
        scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let path_score = rank_weighted_mean(&scores);
        let recency = recency_score(&memory);
        let final_score = weights.path * path_score + weights.importance * memory.importance + weights.recency * recency;
        out.push(ScoredMemory { memory, final_score });
    }

    out.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(top_k);
    Ok(out)
}

/// Weights `1, 1/2, 1/3, ...` applied to descending-sorted scores.
fn rank_weighted_mean(sorted_desc: &[f32]) -> f32 {
    if sorted_desc.is_empty() {
        return 0.0;
    }
    let mut weighted_sum = 0.0f32;
    let mut weight_total = 0.0f32;
    for (i, score) in sorted_desc.iter().enumerate() {
        let w = 1.0 / (i as f32 + 1.0);
        weighted_sum += w * score;
        weight_total += w;
    }
    weighted_sum / weight_total
}

fn recency_score(memory: &Memory) -> f32 {
    let now = chrono::Utc::now();
    let created_days = (now - memory.created_at).num_seconds().max(0) as f32 / 86_400.0;
    let accessed_days = (now - memory.last_accessed_at).num_seconds().max(0) as f32 / 86_400.0;
    0.4 * (-created_days / 30.0).exp() + 0.6 * (-accessed_days / 7.0).exp()
}

/// Runs `interest_match` (the semantic-interest signal, one input among
/// mention/relation/interest during retrieval) under a hard 1.5 s timeout.
/// On expiry, yields the neutral default `0.5` so the other signals still
/// carry the ranking, per `spec.md` §5.
pub async fn calculate_interest_match<F>(interest_match: F, timeout: std::time::Duration) -> f32
where
    F: std::future::Future<Output = f32>,
{
    match tokio::time::timeout(timeout, interest_match).await {
        Ok(score) => score.clamp(0.0, 1.0),
        Err(_) => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_term::{Edge, InMemoryGraphStore, Node, NodeType};

    /// S4 — Path expansion: α=0.85, starting score 0.8, edge w=1.2, node
    /// score 0.6, depth 1 → new_score ≈ 0.8·1.2·0.85 + 0.6·0.15 = 0.906.
    #[test]
    fn seed_scenario_s4_single_hop_scoring_formula() {
        let alpha: f32 = 0.85;
        let path_score = 0.8f32;
        let w_edge = 1.2f32;
        let s_node = 0.6f32;
        let delta = alpha.powi(1);
        let new_score = path_score * w_edge * delta + s_node * (1.0 - delta);
        assert!((new_score - 0.906).abs() < 1e-3);
    }

    #[tokio::test]
    async fn expansion_respects_max_hops() {
        let store = InMemoryGraphStore::new();
        let mut nodes = Vec::new();
        for i in 0..5 {
            let n = Node::new(format!("n{i}"), NodeType::Entity);
            store.upsert_node(n.clone()).await.unwrap();
            nodes.push(n);
        }
        for pair in nodes.windows(2) {
            let e = Edge::new(pair[0].id, pair[1].id, EdgeType::Relation, "next", 0.9);
            store.upsert_edge(e).await.unwrap();
        }

        let config = PathExpansionConfig {
            max_hops: 2,
            pruning_threshold: 0.0,
            ..PathExpansionConfig::default()
        };
        let seeds = vec![SeedNode { node_id: nodes[0].id, score: 0.9 }];
        let best = expand(&store, &config, &seeds, None, &HashMap::new(), &ExpansionRequest::default())
            .await
            .unwrap();

        // With max_hops=2, at most nodes[0..=2] should ever be reached from
        // a chain seeded at nodes[0] (depth 0, 1, 2).
        assert!(best.contains_key(&nodes[2].id));
        assert!(!best.contains_key(&nodes[3].id));
    }

    #[tokio::test]
    async fn best_score_to_node_is_monotone_non_decreasing() {
        let store = InMemoryGraphStore::new();
        let a = Node::new("a".to_string(), NodeType::Entity);
        let b = Node::new("b".to_string(), NodeType::Entity);
        store.upsert_node(a.clone()).await.unwrap();
        store.upsert_node(b.clone()).await.unwrap();
        store.upsert_edge(Edge::new(a.id, b.id, EdgeType::Relation, "x", 0.9)).await.unwrap();

        let config = PathExpansionConfig { max_hops: 3, pruning_threshold: 0.0, ..PathExpansionConfig::default() };
        let seeds = vec![SeedNode { node_id: a.id, score: 0.5 }, SeedNode { node_id: b.id, score: 0.2 }];
        let best = expand(&store, &config, &seeds, None, &HashMap::new(), &ExpansionRequest::default())
            .await
            .unwrap();
        // b was seeded at 0.2 but is also reachable from a; the recorded
        // score must never have decreased below the seed value.
        assert!(best[&b.id] >= 0.2);
    }

    #[test]
    fn final_scoring_is_order_independent_convex_combination() {
        let weights = FinalScoringWeights { path: 0.5, importance: 0.3, recency: 0.2 };
        let a = 0.5 * 0.8 + 0.3 * 0.6 + 0.2 * 0.4;
        let b = 0.3 * 0.6 + 0.5 * 0.8 + 0.2 * 0.4;
        assert!((a - b).abs() < 1e-6);
        let _ = weights;
    }

    #[test]
    fn rank_weighted_mean_favors_the_top_score() {
        let mean = rank_weighted_mean(&[0.9, 0.1]);
        assert!(mean > 0.5);
    }

    /// S6 — interest-matching timeout: a call that takes longer than the
    /// configured timeout yields the neutral default 0.5.
    #[tokio::test]
    async fn seed_scenario_s6_interest_matching_timeout() {
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            0.95f32
        };
        let score = calculate_interest_match(slow, std::time::Duration::from_millis(20)).await;
        assert_eq!(score, 0.5);
    }

    #[tokio::test]
    async fn interest_matching_within_budget_returns_the_real_score() {
        let fast = async { 0.83f32 };
        let score = calculate_interest_match(fast, std::time::Duration::from_millis(20)).await;
        assert_eq!(score, 0.83);
    }
}
