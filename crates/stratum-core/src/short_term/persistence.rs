//! Atomic (tmp file + rename) JSON snapshot persistence for the short-term
//! memory set, per `spec.md` §6.

use std::fs;
use std::path::PathBuf;

use super::ShortTermMemory;
use crate::error::ShortTermError;

pub struct ShortTermSnapshot {
    path: PathBuf,
}

impl ShortTermSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Serialize `memories` (embeddings are already excluded via `#[serde(skip)]`
    /// on `ShortTermMemory::embedding`) and write atomically.
    pub fn write(&self, memories: &[ShortTermMemory]) -> Result<(), ShortTermError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(memories)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<ShortTermMemory>, ShortTermError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::short_term::MemoryType;

    #[test]
    fn write_then_load_round_trips_without_embeddings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short_term_memory.json");
        let store = ShortTermSnapshot::new(&path);

        let mut m = ShortTermMemory::new("chat-1", "alice", MemoryType::Fact, "likes tea");
        m.embedding = Some(vec![0.1, 0.2]);
        store.write(&[m.clone()]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].subject, "alice");
        assert!(loaded[0].embedding.is_none());
    }

    #[test]
    fn write_is_atomic_via_tmp_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short_term_memory.json");
        let store = ShortTermSnapshot::new(&path);
        store.write(&[]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn serialize_twice_is_byte_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short_term_memory.json");
        let store = ShortTermSnapshot::new(&path);
        let m = ShortTermMemory::new("chat-1", "alice", MemoryType::Fact, "likes tea");
        store.write(&[m]).unwrap();
        let loaded = store.load().unwrap();
        let json1 = serde_json::to_string(&loaded).unwrap();
        let json2 = serde_json::to_string(&loaded).unwrap();
        assert_eq!(json1, json2);
    }
}
