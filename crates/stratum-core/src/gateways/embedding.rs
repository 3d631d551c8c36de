//! Embedding Gateway: deterministic text→vector function (batchable).
//!
//! The real embedding backend (ONNX, a hosted API, ...) is explicitly out of
//! scope for this crate; only the trait contract and two in-process
//! implementations live here: a deterministic offline gateway used by tests
//! and as a no-network default, and (behind `http-gateways`) a thin
//! `reqwest` client for a real provider.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// A batchable text→vector function with a fixed output dimension.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Output vector dimension.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Convenience wrapper for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut v = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        Ok(v.pop().unwrap_or_default())
    }
}

/// A stable, dependency-free feature-hashing vectorizer. Not semantically
/// meaningful, but deterministic and collision-tolerant enough to exercise
/// cosine-similarity code paths without a network call.
pub struct DeterministicEmbeddingGateway {
    dimensions: usize,
}

impl DeterministicEmbeddingGateway {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimensions];
        for token in text.split_whitespace() {
            let hash = fnv1a(token.as_bytes());
            let idx = (hash as usize) % self.dimensions;
            let sign = if hash & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for DeterministicEmbeddingGateway {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingGateway for DeterministicEmbeddingGateway {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// HTTP-backed embedding gateway, grounded on the plain-JSON POST client
/// shape used by `aigent-llm`'s provider clients.
#[cfg(feature = "http-gateways")]
pub struct HttpEmbeddingGateway {
    client: reqwest::Client,
    endpoint: String,
    dimensions: usize,
}

#[cfg(feature = "http-gateways")]
impl HttpEmbeddingGateway {
    pub fn new(endpoint: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            dimensions,
        }
    }
}

#[cfg(feature = "http-gateways")]
#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[cfg(feature = "http-gateways")]
#[derive(serde::Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(feature = "http-gateways")]
#[async_trait]
impl EmbeddingGateway for HttpEmbeddingGateway {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { input: texts })
            .send()
            .await
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            if status.is_client_error() {
                return Err(EmbeddingError::Permanent(format!("http {status}")));
            }
            return Err(EmbeddingError::Transient(format!("http {status}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Permanent(e.to_string()))?;
        Ok(parsed.embeddings)
    }
}

/// Cosine similarity, clamped to `[0, 1]` as path expansion and perceptual
/// recall expect (negative similarity is treated as zero relevance, per
/// `spec.md` §4.4's `clamped to [0,1]` wording).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
