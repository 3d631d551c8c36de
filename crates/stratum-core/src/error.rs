//! Error types for the memory engine.
//!
//! Each component owns a small `thiserror` enum; [`EngineError`] aggregates
//! them at the [`crate::coordinator::Coordinator`] boundary so callers deal
//! with one error type regardless of which tier failed.

use thiserror::Error;

/// Errors from the embedding gateway.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Retried and still failed; caller should back off further or skip the item.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Not retryable.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),
    #[error("embedding call timed out")]
    Timeout,
}

/// Errors from the LLM gateway.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transient LLM failure: {0}")]
    Transient(String),
    #[error("permanent LLM failure: {0}")]
    Permanent(String),
    #[error("LLM call timed out")]
    Timeout,
}

/// Errors from the vector index.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("index creation failed: {0}")]
    Creation(String),
    #[error("failed to add vector: {0}")]
    Add(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("vector dimensions mismatch: expected {expected}, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },
    #[error("key not found: {0}")]
    KeyNotFound(uuid::Uuid),
}

/// Errors from the graph store.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("node not found: {0}")]
    NodeNotFound(uuid::Uuid),
    #[error("edge not found: {0}")]
    EdgeNotFound(uuid::Uuid),
    #[error("memory not found: {0}")]
    MemoryNotFound(uuid::Uuid),
    #[error("database error: {0}")]
    #[cfg(feature = "bundled-sqlite")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the perceptual buffer. Non-fatal by design; the manager logs
/// and continues on all of these.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PerceptualError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the short-term manager.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ShortTermError {
    #[error(transparent)]
    Gateway(#[from] LlmError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the long-term manager.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LongTermError {
    #[error(transparent)]
    Gateway(#[from] LlmError),
    #[error(transparent)]
    Graph(#[from] GraphStoreError),
    #[error(transparent)]
    Vector(#[from] VectorIndexError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Top-level error returned by the [`crate::coordinator::Coordinator`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Perceptual(#[from] PerceptualError),
    #[error(transparent)]
    ShortTerm(#[from] ShortTermError),
    #[error(transparent)]
    LongTerm(#[from] LongTermError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Graph(#[from] GraphStoreError),
    #[error(transparent)]
    Vector(#[from] VectorIndexError),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
