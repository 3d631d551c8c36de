//! # Stratum Core
//!
//! Three-tier conversational memory engine:
//!
//! - **Perceptual buffer**: raw message blocks, lexical/semantic recall,
//!   activation-driven promotion.
//! - **Short-Term memory**: structured facts/opinions/relations extracted by
//!   an LLM, with overflow and pressure-relief policies.
//! - **Long-Term knowledge graph**: nodes/edges/memories with a vector
//!   side-index, multi-hop path expansion, and decay/forgetting.
//!
//! A [`coordinator::Coordinator`] ties the tiers together: writes land in
//! the perceptual buffer without blocking on any gateway, while reads run
//! perceptual and short-term recall in parallel and consult a judge before
//! paying for a long-term graph search.
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW vector search via `usearch`. Without
//!   it, long-term retrieval falls back to [`long_term::BruteForceIndex`].
//! - `http-gateways`: `reqwest`-backed [`gateways::LlmGateway`] and
//!   [`gateways::EmbeddingGateway`] implementations for talking to a real
//!   inference service.
//! - `bundled-sqlite`: a `rusqlite`-backed [`long_term::GraphStore`] for
//!   durable on-disk storage, in place of the default in-memory store.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod batch_scheduler;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateways;
pub mod json_tolerant;
pub mod judge;
pub mod long_term;
pub mod path_expansion;
pub mod perceptual;
pub mod short_term;

pub use config::Config;
pub use coordinator::{ChatPhase, Coordinator, SearchOutcome};
pub use error::{EngineError, Result};

/// Convenience re-exports for the common construction path.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordinator::{ChatPhase, Coordinator, SearchOutcome};
    pub use crate::error::{EngineError, Result};
    pub use crate::gateways::{DeterministicEmbeddingGateway, EmbeddingGateway, LlmGateway, MockLlmGateway};
    pub use crate::long_term::{BruteForceIndex, GraphStore, InMemoryGraphStore, LongTermManager, Memory, VectorIndex};
    pub use crate::perceptual::{Message, PerceptualManager};
    pub use crate::short_term::{ShortTermManager, ShortTermMemory};
}
