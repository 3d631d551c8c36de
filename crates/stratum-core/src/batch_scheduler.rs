//! Batch Scheduler: coalesced writes for graph/vector mutations.
//!
//! Grounded on `offline-intelligence`'s `worker_threads` module shape: a
//! bounded queue drained by a background task on size or time triggers,
//! adapted here to the node/edge/memory write-unit `spec.md` §4.3 names,
//! plus the vector-index writes `spec.md` §5's shared-resource policy
//! routes through the same scheduler.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::LongTermError;
use crate::long_term::{Edge, GraphStore, Memory, Node, VectorIndex};

#[derive(Debug, Clone)]
pub enum WriteOp {
    Node(Node),
    Edge(Edge),
    Memory(Memory),
    DeleteMemory(Uuid),
    VectorUpsert(Uuid, Vec<f32>),
    VectorDelete(Uuid),
}

#[derive(Debug, Clone)]
pub struct BatchSchedulerConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Queues graph/vector mutations and flushes them to the backing stores
/// either when the queue reaches `max_batch_size` or a background timer
/// fires. Holds the stores it writes to, so callers never need to pass them
/// back in at flush time.
pub struct BatchScheduler {
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorIndex>,
    pending: Arc<Mutex<Vec<WriteOp>>>,
    sender: mpsc::UnboundedSender<WriteOp>,
    handle: tokio::task::JoinHandle<()>,
}

impl BatchScheduler {
    pub fn spawn(graph: Arc<dyn GraphStore>, vectors: Arc<dyn VectorIndex>, config: BatchSchedulerConfig) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriteOp>();
        let pending = Arc::new(Mutex::new(Vec::new()));
        let pending_for_task = pending.clone();
        let task_graph = graph.clone();
        let task_vectors = vectors.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.flush_interval);
            loop {
                tokio::select! {
                    maybe_op = receiver.recv() => {
                        match maybe_op {
                            Some(op) => {
                                let mut guard = pending_for_task.lock().await;
                                guard.push(op);
                                if guard.len() >= config.max_batch_size {
                                    let batch = std::mem::take(&mut *guard);
                                    drop(guard);
                                    flush_batch(&task_graph, &task_vectors, batch).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let mut guard = pending_for_task.lock().await;
                        if !guard.is_empty() {
                            let batch = std::mem::take(&mut *guard);
                            drop(guard);
                            flush_batch(&task_graph, &task_vectors, batch).await;
                        }
                    }
                }
            }
        });

        Self { graph, vectors, pending, sender, handle }
    }

    /// The graph store this scheduler eventually writes to. Safe to read
    /// from directly: reads bypass the queue and always see the latest
    /// flushed state.
    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn enqueue(&self, op: WriteOp) {
        if self.sender.send(op).is_err() {
            tracing::warn!("batch scheduler channel closed; dropping write");
        }
    }

    /// Flush whatever is queued right now, bypassing the timer. Used on
    /// shutdown and before a search that needs the latest writes visible.
    pub async fn flush_now(&self) {
        let mut guard = self.pending.lock().await;
        if guard.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut *guard);
        drop(guard);
        flush_batch(&self.graph, &self.vectors, batch).await;
    }

    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}

async fn flush_batch(graph: &Arc<dyn GraphStore>, vectors: &Arc<dyn VectorIndex>, batch: Vec<WriteOp>) {
    for op in batch {
        let outcome: Result<(), LongTermError> = async {
            match op {
                WriteOp::Node(node) => Ok(graph.upsert_node(node).await?),
                WriteOp::Edge(edge) => Ok(graph.upsert_edge(edge).await?),
                WriteOp::Memory(memory) => Ok(graph.upsert_memory(memory).await?),
                WriteOp::DeleteMemory(id) => Ok(graph.delete_memory(id).await?),
                WriteOp::VectorUpsert(id, vector) => Ok(vectors.upsert(id, vector).await?),
                WriteOp::VectorDelete(id) => Ok(vectors.delete(id).await?),
            }
        }
        .await;
        if let Err(err) = outcome {
            tracing::warn!(%err, "batched write failed");
        }
    }
}
