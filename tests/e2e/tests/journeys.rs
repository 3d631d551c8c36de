//! Cross-tier integration tests: a message travels from the perceptual
//! buffer through short-term extraction into the long-term graph, and the
//! coordinator's read path is exercised end to end.

use std::sync::Arc;
use std::time::Duration;

use stratum_core::config::Config;
use stratum_core::coordinator::Coordinator;
use stratum_core::gateways::{DeterministicEmbeddingGateway, EmbeddingGateway, MockLlmGateway};
use stratum_core::long_term::{BruteForceIndex, GraphStore, InMemoryGraphStore, LongTermManager, VectorIndex};
use stratum_core::perceptual::{Message, PerceptualManager};
use stratum_core::short_term::ShortTermManager;

fn build_coordinator(llm_responses: Vec<&str>) -> Arc<Coordinator> {
    let config = Config::default();
    let llm = Arc::new(MockLlmGateway::new(llm_responses.into_iter().map(String::from)));
    let embedder: Arc<dyn EmbeddingGateway> = Arc::new(DeterministicEmbeddingGateway::new(32));
    let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
    let vectors: Arc<dyn VectorIndex> = Arc::new(BruteForceIndex::new(32));
    let perceptual = PerceptualManager::new(config.perceptual.clone());
    let short_term = ShortTermManager::new(config.short_term.clone(), llm.clone(), embedder.clone());
    Arc::new(Coordinator::new(config, perceptual, short_term, graph, vectors, embedder, llm))
}

/// A message ingested through the coordinator is recallable from the
/// perceptual tier without touching any gateway.
#[tokio::test]
async fn message_lands_in_perceptual_and_is_recallable() {
    let coordinator = build_coordinator(vec![]);
    coordinator.add_message(Message::new("chat-1", "alice", "alice loves hiking in the mountains")).await;

    let outcome = coordinator.search_memories("chat-1", "hiking", false, &[]).await.unwrap();
    assert!(!outcome.recalled_blocks.is_empty());
    assert!(!outcome.used_long_term);

    coordinator.shutdown().await;
}

/// A short-term memory extracted from a block, once transferred, is
/// reachable through a direct long-term vector search. Exercises
/// Short-Term -> Long-Term independent of the coordinator's occupancy gate,
/// since driving that gate to 1.0 deterministically would require scripting
/// far more mock LLM turns than the behavior under test needs.
#[tokio::test]
async fn short_term_memory_transfers_into_the_long_term_graph() {
    let config = Config::default();
    let embedder: Arc<dyn EmbeddingGateway> = Arc::new(DeterministicEmbeddingGateway::new(32));
    let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
    let vectors: Arc<dyn VectorIndex> = Arc::new(BruteForceIndex::new(32));

    let extraction_llm = Arc::new(MockLlmGateway::new(vec![
        r#"{"op": "create_new", "memory_fields": {"subject": "alice", "memory_type": "fact", "topic": "hobby", "object": "hiking", "importance": 0.8}}"#.to_string(),
    ]));
    let mut short_term = ShortTermManager::new(config.short_term.clone(), extraction_llm.clone(), embedder.clone());

    let mut block = stratum_core::perceptual::Block::new("chat-1".to_string());
    block.messages.push(Message::new("chat-1", "alice", "I love hiking in the mountains"));

    let created = short_term.add_from_block(&block).await.unwrap();
    assert!(created.is_some());

    let transfer_llm = Arc::new(MockLlmGateway::new(vec![
        r#"[{"op": "create_node", "temp_id": "n1", "args": {"content": "alice", "type": "person"}},
            {"op": "create_node", "temp_id": "n2", "args": {"content": "hiking", "type": "topic"}},
            {"op": "create_edge", "args": {"source_id": "n1", "target_id": "n2", "edge_type": "relation", "relation_text": "enjoys", "importance": 0.8}},
            {"op": "create_memory", "args": {"node_ids": ["n1", "n2"], "importance": 0.8}}]"#.to_string(),
    ]));
    let long_term = LongTermManager::new(config.long_term.clone(), transfer_llm, embedder.clone(), graph.clone(), vectors.clone());

    let batch = short_term.get_memories_for_transfer();
    assert_eq!(batch.len(), 1);

    let result = long_term.transfer_from_short_term(batch).await.unwrap();
    assert_eq!(result.transferred_ids.len(), 1);
    assert!(result.failed_ids.is_empty());

    short_term.clear_transferred(&result.transferred_ids);
    assert_eq!(short_term.get_memories_for_transfer().len(), 0);

    let query_embedding = embedder.embed("hiking").await.unwrap();
    let hits = long_term.search_memories(&query_embedding, 5).await.unwrap();
    assert!(!hits.is_empty());
}

/// The read path runs the judge and, when it reports insufficient
/// confidence, escalates to a long-term graph search using the judge's
/// supplemental queries.
#[tokio::test]
async fn judge_gated_search_escalates_to_long_term_when_insufficient() {
    let coordinator = build_coordinator(vec![
        r#"{"sufficient": false, "confidence": 0.2, "supplemental_queries": ["hiking trails", "mountain gear"]}"#,
    ]);
    coordinator.add_message(Message::new("chat-1", "alice", "alice loves hiking in the mountains")).await;

    let outcome = coordinator
        .search_memories("chat-1", "what does alice enjoy", true, &["alice mentioned hiking earlier".to_string()])
        .await
        .unwrap();

    assert!(outcome.used_long_term);
    coordinator.shutdown().await;
}

/// Coordinator shutdown cancels the auto-transfer task and persists
/// short-term state within the bounded timeout, even with nothing queued.
#[tokio::test]
async fn shutdown_completes_promptly_with_no_pending_work() {
    let coordinator = build_coordinator(vec![]);
    coordinator.add_message(Message::new("chat-1", "bob", "just chatting")).await;

    let shutdown = tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown());
    shutdown.await.expect("shutdown should complete within the bound");
}
