//! Two-level K/V cache for query results and node lookups.
//!
//! Grounded on `offline-intelligence`'s `context_engine::tier_manager::TierManager`,
//! which keeps a `moka::sync::Cache` per tier with a `time_to_idle` eviction
//! policy and falls back to the backing store on a miss.

use moka::sync::Cache;
use std::time::Duration;
use uuid::Uuid;

use crate::long_term::{Memory, Node};

/// Caches long-term search results by query text and node lookups by id, so
/// repeated retrieval for the same query (e.g. supplemental queries sharing
/// a root) or repeated path-expansion hops over the same node avoid a
/// round-trip to the graph store / vector index.
pub struct CacheLayer {
    query_results: Cache<String, Vec<Memory>>,
    nodes: Cache<Uuid, Node>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_query_entries: u64,
    pub max_node_entries: u64,
    pub time_to_idle: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_query_entries: 512,
            max_node_entries: 4096,
            time_to_idle: Duration::from_secs(300),
        }
    }
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            query_results: Cache::builder()
                .max_capacity(config.max_query_entries)
                .time_to_idle(config.time_to_idle)
                .build(),
            nodes: Cache::builder()
                .max_capacity(config.max_node_entries)
                .time_to_idle(config.time_to_idle)
                .build(),
        }
    }

    pub fn get_query(&self, key: &str) -> Option<Vec<Memory>> {
        self.query_results.get(key)
    }

    pub fn put_query(&self, key: String, value: Vec<Memory>) {
        self.query_results.insert(key, value);
    }

    pub fn invalidate_query(&self, key: &str) {
        self.query_results.invalidate(key);
    }

    pub fn invalidate_all_queries(&self) {
        self.query_results.invalidate_all();
    }

    pub fn get_node(&self, id: &Uuid) -> Option<Node> {
        self.nodes.get(id)
    }

    pub fn put_node(&self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn invalidate_node(&self, id: &Uuid) {
        self.nodes.invalidate(id);
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_term::NodeType;

    #[test]
    fn query_cache_roundtrips() {
        let cache = CacheLayer::default();
        assert!(cache.get_query("q").is_none());
        cache.put_query("q".to_string(), vec![]);
        assert!(cache.get_query("q").is_some());
        cache.invalidate_query("q");
        assert!(cache.get_query("q").is_none());
    }

    #[test]
    fn node_cache_roundtrips() {
        let cache = CacheLayer::default();
        let node = Node::new("Alice".to_string(), NodeType::Person);
        let id = node.id;
        cache.put_node(node);
        assert!(cache.get_node(&id).is_some());
        cache.invalidate_node(&id);
        assert!(cache.get_node(&id).is_none());
    }
}
