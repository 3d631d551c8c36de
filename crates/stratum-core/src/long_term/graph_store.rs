//! Graph Store: typed nodes/edges, adjacency, memory↔node map.
//!
//! `InMemoryGraphStore` is the always-available default. `SqliteGraphStore`
//! (behind `bundled-sqlite`) is grounded on `vestige-core::storage::sqlite`'s
//! `Mutex<Connection>` + PRAGMA setup for the "best-effort file/DB
//! persistence" contract named in `spec.md`'s Non-goals.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::{Edge, Memory, Node};
use crate::error::GraphStoreError;

/// Single-writer/multi-reader typed graph, per `spec.md` §5. Implementations
/// must serialize adjacency updates internally.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_node(&self, id: Uuid) -> Result<Option<Node>, GraphStoreError>;
    async fn get_outgoing_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError>;
    async fn get_incoming_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError>;
    async fn get_memories_by_node(&self, node_id: Uuid) -> Result<Vec<Uuid>, GraphStoreError>;
    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, GraphStoreError>;

    async fn upsert_node(&self, node: Node) -> Result<(), GraphStoreError>;
    async fn upsert_edge(&self, edge: Edge) -> Result<(), GraphStoreError>;
    /// Inserts/updates `memory` and keeps the node→memories inverted index
    /// in lock-step with `memory.node_ids` (spec.md §3 invariant).
    async fn upsert_memory(&self, memory: Memory) -> Result<(), GraphStoreError>;
    async fn delete_memory(&self, id: Uuid) -> Result<(), GraphStoreError>;

    /// All memory ids currently in the store, for consolidation/decay sweeps.
    async fn all_memory_ids(&self) -> Result<Vec<Uuid>, GraphStoreError>;
    async fn all_node_ids(&self) -> Result<Vec<Uuid>, GraphStoreError>;
}

#[derive(Default)]
struct InMemoryState {
    nodes: HashMap<Uuid, Node>,
    edges: HashMap<Uuid, Edge>,
    memories: HashMap<Uuid, Memory>,
    outgoing: HashMap<Uuid, Vec<Uuid>>,
    incoming: HashMap<Uuid, Vec<Uuid>>,
    node_to_memories: HashMap<Uuid, HashSet<Uuid>>,
}

/// Default graph store: a plain in-process map, guarded by one mutex
/// (single-writer/multi-reader is enforced by serializing through the lock
/// rather than by a reader/writer split, since there is no file I/O here).
pub struct InMemoryGraphStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
        }
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_node(&self, id: Uuid) -> Result<Option<Node>, GraphStoreError> {
        Ok(self.state.lock().unwrap().nodes.get(&id).cloned())
    }

    async fn get_outgoing_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError> {
        let state = self.state.lock().unwrap();
        let mut edges: Vec<Edge> = state
            .outgoing
            .get(&node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.edges.get(id).cloned())
            .collect();
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    async fn get_incoming_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError> {
        let state = self.state.lock().unwrap();
        let mut edges: Vec<Edge> = state
            .incoming
            .get(&node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.edges.get(id).cloned())
            .collect();
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    async fn get_memories_by_node(&self, node_id: Uuid) -> Result<Vec<Uuid>, GraphStoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_to_memories
            .get(&node_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, GraphStoreError> {
        Ok(self.state.lock().unwrap().memories.get(&id).cloned())
    }

    async fn upsert_node(&self, node: Node) -> Result<(), GraphStoreError> {
        self.state.lock().unwrap().nodes.insert(node.id, node);
        Ok(())
    }

    async fn upsert_edge(&self, edge: Edge) -> Result<(), GraphStoreError> {
        let mut state = self.state.lock().unwrap();
        state.outgoing.entry(edge.source_id).or_default().push(edge.id);
        state.incoming.entry(edge.target_id).or_default().push(edge.id);
        state.edges.insert(edge.id, edge);
        Ok(())
    }

    async fn upsert_memory(&self, memory: Memory) -> Result<(), GraphStoreError> {
        let mut state = self.state.lock().unwrap();
        // Drop stale node->memory links for a pre-existing memory before
        // re-adding under the new node_ids, keeping the inverted index
        // consistent with memory.node_ids (spec.md §3 invariant).
        if let Some(previous) = state.memories.get(&memory.id).cloned() {
            for node_id in &previous.node_ids {
                if let Some(set) = state.node_to_memories.get_mut(node_id) {
                    set.remove(&memory.id);
                }
            }
        }
        for node_id in &memory.node_ids {
            state.node_to_memories.entry(*node_id).or_default().insert(memory.id);
        }
        state.memories.insert(memory.id, memory);
        Ok(())
    }

    async fn delete_memory(&self, id: Uuid) -> Result<(), GraphStoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(memory) = state.memories.remove(&id) {
            for node_id in &memory.node_ids {
                if let Some(set) = state.node_to_memories.get_mut(node_id) {
                    set.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn all_memory_ids(&self) -> Result<Vec<Uuid>, GraphStoreError> {
        Ok(self.state.lock().unwrap().memories.keys().copied().collect())
    }

    async fn all_node_ids(&self) -> Result<Vec<Uuid>, GraphStoreError> {
        Ok(self.state.lock().unwrap().nodes.keys().copied().collect())
    }
}

#[cfg(feature = "bundled-sqlite")]
mod sqlite_store {
    use super::*;
    use chrono::{DateTime, Utc};
    use rusqlite::{params, Connection, OptionalExtension};

    /// SQLite-backed graph store. Connection setup mirrors
    /// `vestige-core::storage::sqlite::configure_connection`'s PRAGMA block
    /// (WAL, NORMAL synchronous, foreign keys on) and its writer/reader
    /// connection split.
    pub struct SqliteGraphStore {
        writer: Mutex<Connection>,
    }

    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(())
    }

    impl SqliteGraphStore {
        pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, GraphStoreError> {
            let conn = Connection::open(path)?;
            configure_connection(&conn)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS nodes (
                    id TEXT PRIMARY KEY, content TEXT NOT NULL, node_type TEXT NOT NULL,
                    embedding TEXT, metadata TEXT NOT NULL, created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS edges (
                    id TEXT PRIMARY KEY, source_id TEXT NOT NULL, target_id TEXT NOT NULL,
                    edge_type TEXT NOT NULL, relation_text TEXT NOT NULL, importance REAL NOT NULL,
                    metadata TEXT NOT NULL, created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS memories (
                    id TEXT PRIMARY KEY, node_ids TEXT NOT NULL, edge_ids TEXT NOT NULL,
                    memory_type TEXT NOT NULL, importance REAL NOT NULL, activation REAL NOT NULL,
                    created_at TEXT NOT NULL, last_accessed_at TEXT NOT NULL, access_count INTEGER NOT NULL,
                    decay_factor REAL NOT NULL, privacy_label TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
                CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);",
            )?;
            Ok(Self { writer: Mutex::new(conn) })
        }

        fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
            let embedding: Option<String> = row.get("embedding")?;
            let metadata: String = row.get("metadata")?;
            let created_at: String = row.get("created_at")?;
            Ok(Node {
                id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
                content: row.get("content")?,
                node_type: super::super::NodeType::parse_lenient(&row.get::<_, String>("node_type")?),
                embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
            })
        }
    }

    #[async_trait]
    impl GraphStore for SqliteGraphStore {
        async fn get_node(&self, id: Uuid) -> Result<Option<Node>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.query_row("SELECT * FROM nodes WHERE id = ?1", params![id.to_string()], Self::row_to_node)
                .optional()
                .map_err(GraphStoreError::from)
        }

        async fn get_outgoing_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError> {
            self.edges_where("source_id", node_id)
        }

        async fn get_incoming_edges(&self, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError> {
            self.edges_where("target_id", node_id)
        }

        async fn get_memories_by_node(&self, node_id: Uuid) -> Result<Vec<Uuid>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id, node_ids FROM memories")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let node_ids: String = row.get(1)?;
                Ok((id, node_ids))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, node_ids) = row?;
                let node_ids: Vec<Uuid> = serde_json::from_str(&node_ids).unwrap_or_default();
                if node_ids.contains(&node_id) {
                    if let Ok(id) = Uuid::parse_str(&id) {
                        out.push(id);
                    }
                }
            }
            Ok(out)
        }

        async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.query_row("SELECT * FROM memories WHERE id = ?1", params![id.to_string()], |row| {
                Ok(Memory {
                    id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
                    node_ids: serde_json::from_str(&row.get::<_, String>("node_ids")?).unwrap_or_default(),
                    edge_ids: serde_json::from_str(&row.get::<_, String>("edge_ids")?).unwrap_or_default(),
                    memory_type: row.get("memory_type")?,
                    importance: row.get("importance")?,
                    activation: row.get("activation")?,
                    created_at: row.get::<_, String>("created_at")?.parse().unwrap_or_else(|_| Utc::now()),
                    last_accessed_at: row.get::<_, String>("last_accessed_at")?.parse().unwrap_or_else(|_| Utc::now()),
                    access_count: row.get::<_, i64>("access_count")? as u64,
                    decay_factor: row.get("decay_factor")?,
                    privacy_label: row.get("privacy_label")?,
                })
            })
            .optional()
            .map_err(GraphStoreError::from)
        }

        async fn upsert_node(&self, node: Node) -> Result<(), GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.execute(
                "INSERT INTO nodes (id, content, node_type, embedding, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET content=excluded.content, node_type=excluded.node_type,
                    embedding=excluded.embedding, metadata=excluded.metadata",
                params![
                    node.id.to_string(),
                    node.content,
                    format!("{:?}", node.node_type),
                    node.embedding.map(|e| serde_json::to_string(&e).unwrap_or_default()),
                    serde_json::to_string(&node.metadata).unwrap_or_default(),
                    node.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        }

        async fn upsert_edge(&self, edge: Edge) -> Result<(), GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.execute(
                "INSERT INTO edges (id, source_id, target_id, edge_type, relation_text, importance, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET importance=excluded.importance, relation_text=excluded.relation_text",
                params![
                    edge.id.to_string(),
                    edge.source_id.to_string(),
                    edge.target_id.to_string(),
                    format!("{:?}", edge.edge_type),
                    edge.relation_text,
                    edge.importance,
                    serde_json::to_string(&edge.metadata).unwrap_or_default(),
                    edge.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        }

        async fn upsert_memory(&self, memory: Memory) -> Result<(), GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.execute(
                "INSERT INTO memories (id, node_ids, edge_ids, memory_type, importance, activation,
                    created_at, last_accessed_at, access_count, decay_factor, privacy_label)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET node_ids=excluded.node_ids, edge_ids=excluded.edge_ids,
                    importance=excluded.importance, activation=excluded.activation,
                    last_accessed_at=excluded.last_accessed_at, access_count=excluded.access_count,
                    decay_factor=excluded.decay_factor",
                params![
                    memory.id.to_string(),
                    serde_json::to_string(&memory.node_ids).unwrap_or_default(),
                    serde_json::to_string(&memory.edge_ids).unwrap_or_default(),
                    memory.memory_type,
                    memory.importance,
                    memory.activation,
                    memory.created_at.to_rfc3339(),
                    memory.last_accessed_at.to_rfc3339(),
                    memory.access_count as i64,
                    memory.decay_factor,
                    memory.privacy_label,
                ],
            )?;
            Ok(())
        }

        async fn delete_memory(&self, id: Uuid) -> Result<(), GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            conn.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        }

        async fn all_memory_ids(&self) -> Result<Vec<Uuid>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id FROM memories")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.filter_map(|r| r.ok()).filter_map(|s| Uuid::parse_str(&s).ok()).collect())
        }

        async fn all_node_ids(&self) -> Result<Vec<Uuid>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id FROM nodes")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.filter_map(|r| r.ok()).filter_map(|s| Uuid::parse_str(&s).ok()).collect())
        }
    }

    impl SqliteGraphStore {
        fn edges_where(&self, column: &str, node_id: Uuid) -> Result<Vec<Edge>, GraphStoreError> {
            let conn = self.writer.lock().unwrap();
            let sql = format!("SELECT * FROM edges WHERE {column} = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![node_id.to_string()], |row| {
                Ok(Edge {
                    id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
                    source_id: Uuid::parse_str(&row.get::<_, String>("source_id")?).unwrap_or_default(),
                    target_id: Uuid::parse_str(&row.get::<_, String>("target_id")?).unwrap_or_default(),
                    edge_type: super::super::EdgeType::parse_lenient(&row.get::<_, String>("edge_type")?),
                    relation_text: row.get("relation_text")?,
                    importance: row.get("importance")?,
                    metadata: serde_json::from_str(&row.get::<_, String>("metadata")?).unwrap_or_default(),
                    created_at: row.get::<_, String>("created_at")?.parse().unwrap_or_else(|_| Utc::now()),
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        }
    }
}

#[cfg(feature = "bundled-sqlite")]
pub use sqlite_store::SqliteGraphStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_term::NodeType;

    #[tokio::test]
    async fn upsert_memory_keeps_node_index_consistent() {
        let store = InMemoryGraphStore::new();
        let n1 = Node::new("Alice".to_string(), NodeType::Person);
        let n2 = Node::new("likes tea".to_string(), NodeType::Event);
        store.upsert_node(n1.clone()).await.unwrap();
        store.upsert_node(n2.clone()).await.unwrap();
        let memory = Memory::new(vec![n1.id, n2.id], vec![], 0.7, 0.95);
        store.upsert_memory(memory.clone()).await.unwrap();

        assert_eq!(store.get_memories_by_node(n1.id).await.unwrap(), vec![memory.id]);
        assert_eq!(store.get_memories_by_node(n2.id).await.unwrap(), vec![memory.id]);
    }

    #[tokio::test]
    async fn re_upserting_memory_with_fewer_nodes_drops_stale_links() {
        let store = InMemoryGraphStore::new();
        let n1 = Node::new("Alice".to_string(), NodeType::Person);
        let n2 = Node::new("Bob".to_string(), NodeType::Person);
        store.upsert_node(n1.clone()).await.unwrap();
        store.upsert_node(n2.clone()).await.unwrap();
        let mut memory = Memory::new(vec![n1.id, n2.id], vec![], 0.5, 0.95);
        store.upsert_memory(memory.clone()).await.unwrap();

        memory.node_ids = vec![n1.id];
        store.upsert_memory(memory.clone()).await.unwrap();

        assert_eq!(store.get_memories_by_node(n1.id).await.unwrap(), vec![memory.id]);
        assert!(store.get_memories_by_node(n2.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_memory_clears_node_index() {
        let store = InMemoryGraphStore::new();
        let n1 = Node::new("Alice".to_string(), NodeType::Person);
        store.upsert_node(n1.clone()).await.unwrap();
        let memory = Memory::new(vec![n1.id], vec![], 0.5, 0.95);
        store.upsert_memory(memory.clone()).await.unwrap();
        store.delete_memory(memory.id).await.unwrap();
        assert!(store.get_memories_by_node(n1.id).await.unwrap().is_empty());
        assert!(store.get_memory(memory.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outgoing_and_incoming_edges_are_deterministically_ordered() {
        let store = InMemoryGraphStore::new();
        let n1 = Node::new("A".to_string(), NodeType::Entity);
        let n2 = Node::new("B".to_string(), NodeType::Entity);
        store.upsert_node(n1.clone()).await.unwrap();
        store.upsert_node(n2.clone()).await.unwrap();
        let e1 = Edge::new(n1.id, n2.id, crate::long_term::EdgeType::Relation, "knows", 0.5);
        store.upsert_edge(e1.clone()).await.unwrap();

        let out = store.get_outgoing_edges(n1.id).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, e1.id);
        let inc = store.get_incoming_edges(n2.id).await.unwrap();
        assert_eq!(inc[0].id, e1.id);
    }
}
