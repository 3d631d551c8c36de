//! External collaborator contracts: embedding and LLM gateways.
//!
//! The real backends (an ONNX runtime, a hosted completions API, ...) are
//! explicitly out of scope for this crate; these traits are the seam the
//! surrounding application plugs its own implementation into.

mod embedding;
mod llm;

pub use embedding::{cosine_similarity, DeterministicEmbeddingGateway, EmbeddingGateway};
pub use llm::{retry_with_backoff, CompletionOptions, LlmGateway, MockLlmGateway};

#[cfg(feature = "http-gateways")]
pub use embedding::HttpEmbeddingGateway;
#[cfg(feature = "http-gateways")]
pub use llm::HttpLlmGateway;
