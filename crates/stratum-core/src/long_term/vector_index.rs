//! Vector Index: nearest-neighbor search over node embeddings.
//!
//! `UsearchIndex` (behind `vector-search`, default-on) is grounded on
//! `vestige-core::search::vector::VectorIndex`: a `usearch::Index` wrapped
//! with `key<->id` maps since usearch keys are raw `u64`s and this crate's
//! keys are `Uuid`s. `BruteForceIndex` is an exact fallback used when the
//! feature is off, and is what this crate's own tests run against.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::VectorIndexError;
use crate::gateways::cosine_similarity;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;
    async fn upsert(&self, node_id: Uuid, vector: Vec<f32>) -> Result<(), VectorIndexError>;
    async fn upsert_batch(&self, items: Vec<(Uuid, Vec<f32>)>) -> Result<(), VectorIndexError> {
        for (id, vector) in items {
            self.upsert(id, vector).await?;
        }
        Ok(())
    }
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Uuid, f32)>, VectorIndexError>;
    async fn delete(&self, node_id: Uuid) -> Result<(), VectorIndexError>;
    async fn len(&self) -> usize;
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Exact brute-force cosine scan. `O(n)` per query; correct at any scale,
/// used as the default test backend to avoid a native HNSW build in CI
/// sandboxes, and as the production fallback when `vector-search` is off.
pub struct BruteForceIndex {
    dimensions: usize,
    vectors: Mutex<HashMap<Uuid, Vec<f32>>>,
}

impl BruteForceIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for BruteForceIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert(&self, node_id: Uuid, vector: Vec<f32>) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimensions {
            return Err(VectorIndexError::InvalidDimensions {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        self.vectors.lock().unwrap().insert(node_id, vector);
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Uuid, f32)>, VectorIndexError> {
        let vectors = self.vectors.lock().unwrap();
        let mut scored: Vec<(Uuid, f32)> = vectors
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, node_id: Uuid) -> Result<(), VectorIndexError> {
        self.vectors.lock().unwrap().remove(&node_id);
        Ok(())
    }

    async fn len(&self) -> usize {
        self.vectors.lock().unwrap().len()
    }
}

#[cfg(feature = "vector-search")]
mod usearch_index {
    use super::*;
    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    /// HNSW-backed index. Key translation mirrors
    /// `vestige-core::search::vector::VectorIndex`'s `key_to_id`/`id_to_key`
    /// map pair, since `usearch` addresses vectors by `u64`.
    pub struct UsearchIndex {
        dimensions: usize,
        index: Index,
        key_to_id: Mutex<HashMap<u64, Uuid>>,
        id_to_key: Mutex<HashMap<Uuid, u64>>,
        next_key: Mutex<u64>,
    }

    impl UsearchIndex {
        pub fn new(dimensions: usize) -> Result<Self, VectorIndexError> {
            let options = IndexOptions {
                dimensions,
                metric: MetricKind::Cos,
                quantization: ScalarKind::F32,
                connectivity: 16,
                expansion_add: 128,
                expansion_search: 64,
                multi: false,
            };
            let index = Index::new(&options).map_err(|e| VectorIndexError::Creation(e.to_string()))?;
            index.reserve(1024).map_err(|e| VectorIndexError::Creation(e.to_string()))?;
            Ok(Self {
                dimensions,
                index,
                key_to_id: Mutex::new(HashMap::new()),
                id_to_key: Mutex::new(HashMap::new()),
                next_key: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl VectorIndex for UsearchIndex {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn upsert(&self, node_id: Uuid, vector: Vec<f32>) -> Result<(), VectorIndexError> {
            if vector.len() != self.dimensions {
                return Err(VectorIndexError::InvalidDimensions {
                    expected: self.dimensions,
                    actual: vector.len(),
                });
            }
            // usearch has no in-place update; re-adding an existing key
            // requires removing the stale entry first.
            if let Some(&existing_key) = self.id_to_key.lock().unwrap().get(&node_id) {
                let _ = self.index.remove(existing_key);
            }
            if self.index.size() + 1 > self.index.capacity() {
                self.index
                    .reserve(self.index.capacity() * 2 + 1)
                    .map_err(|e| VectorIndexError::Add(e.to_string()))?;
            }
            let key = {
                let mut next = self.next_key.lock().unwrap();
                let k = *next;
                *next += 1;
                k
            };
            self.index.add(key, &vector).map_err(|e| VectorIndexError::Add(e.to_string()))?;
            self.key_to_id.lock().unwrap().insert(key, node_id);
            self.id_to_key.lock().unwrap().insert(node_id, key);
            Ok(())
        }

        async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Uuid, f32)>, VectorIndexError> {
            let results = self
                .index
                .search(vector, top_k)
                .map_err(|e| VectorIndexError::Search(e.to_string()))?;
            let key_to_id = self.key_to_id.lock().unwrap();
            Ok(results
                .keys
                .iter()
                .zip(results.distances.iter())
                .filter_map(|(key, distance)| key_to_id.get(key).map(|id| (*id, 1.0 - distance)))
                .collect())
        }

        async fn delete(&self, node_id: Uuid) -> Result<(), VectorIndexError> {
            if let Some(key) = self.id_to_key.lock().unwrap().remove(&node_id) {
                self.key_to_id.lock().unwrap().remove(&key);
                let _ = self.index.remove(key);
            }
            Ok(())
        }

        async fn len(&self) -> usize {
            self.index.size()
        }
    }
}

#[cfg(feature = "vector-search")]
pub use usearch_index::UsearchIndex;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn brute_force_rejects_wrong_dimensions() {
        let idx = BruteForceIndex::new(4);
        let err = idx.upsert(Uuid::new_v4(), vec![1.0, 2.0]).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::InvalidDimensions { expected: 4, actual: 2 }));
    }

    #[tokio::test]
    async fn brute_force_query_returns_closest_first() {
        let idx = BruteForceIndex::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        idx.upsert(a, vec![1.0, 0.0]).await.unwrap();
        idx.upsert(b, vec![0.0, 1.0]).await.unwrap();
        let results = idx.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results[0].0, a);
    }

    #[tokio::test]
    async fn brute_force_delete_removes_entry() {
        let idx = BruteForceIndex::new(2);
        let a = Uuid::new_v4();
        idx.upsert(a, vec![1.0, 0.0]).await.unwrap();
        assert_eq!(idx.len().await, 1);
        idx.delete(a).await.unwrap();
        assert_eq!(idx.len().await, 0);
    }
}
