//! Append-only JSONL persistence for perceptual blocks, one file per chat
//! directory, one JSON object per line per `spec.md` §6.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::Block;
use crate::error::PerceptualError;

pub struct PerceptualStore {
    dir: PathBuf,
}

impl PerceptualStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, chat_id: &str) -> PathBuf {
        self.dir.join(format!("{chat_id}.perceptual_blocks.jsonl"))
    }

    /// Append the block's current state as one JSON line. Each call appends
    /// a new line rather than rewriting the whole file; readers take the
    /// last line per block id as authoritative.
    pub fn append_block(&self, block: &Block) -> Result<(), PerceptualError> {
        let path = self.path_for(&block.chat_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(block)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Rewrite the chat's JSONL file with `block_id`'s lines dropped. This
    /// is a truncate-and-rewrite, acceptable at the scale `max_blocks`
    /// bounds this file to.
    pub fn remove_block(&self, chat_id: &str, block_id: Uuid) -> Result<(), PerceptualError> {
        let path = self.path_for(chat_id);
        if !path.exists() {
            return Ok(());
        }
        let kept = Self::read_lines_excluding(&path, block_id)?;
        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for line in kept {
                writeln!(tmp, "{line}")?;
            }
        }
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    fn read_lines_excluding(path: &Path, block_id: Uuid) -> Result<Vec<String>, PerceptualError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut kept = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Block>(&line) {
                Ok(block) if block.id == block_id => continue,
                _ => kept.push(line),
            }
        }
        Ok(kept)
    }

    /// Load every block last seen for `chat_id`, in file order. Used to
    /// rehydrate a `PerceptualManager` after a restart.
    pub fn load_chat(&self, chat_id: &str) -> Result<Vec<Block>, PerceptualError> {
        let path = self.path_for(chat_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut by_id: std::collections::HashMap<Uuid, Block> = std::collections::HashMap::new();
        let mut order: Vec<Uuid> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let block: Block = match serde_json::from_str(&line) {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(%err, "skipping malformed perceptual block line");
                    continue;
                }
            };
            if !by_id.contains_key(&block.id) {
                order.push(block.id);
            }
            by_id.insert(block.id, block);
        }
        Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perceptual::Message;

    fn sample_block(chat_id: &str) -> Block {
        let mut mgr = crate::perceptual::PerceptualManager::new(crate::config::PerceptualConfig {
            max_blocks: 10,
            block_size: 5,
            activation_threshold: 3,
            recall_threshold: 0.5,
        });
        mgr.add_message(chat_id, Message::new(chat_id, "u1", "hello"));
        mgr.blocks_pending_transfer();
        mgr.recall_blocks(chat_id, "hello", None, 10, 0.0).remove(0)
    }

    #[test]
    fn append_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PerceptualStore::new(tmp.path()).unwrap();
        let block = sample_block("chat-1");
        store.append_block(&block).unwrap();

        let loaded = store.load_chat("chat-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, block.id);
    }

    #[test]
    fn remove_block_drops_only_that_block() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PerceptualStore::new(tmp.path()).unwrap();
        let b1 = sample_block("chat-1");
        let b2 = sample_block("chat-1");
        store.append_block(&b1).unwrap();
        store.append_block(&b2).unwrap();

        store.remove_block("chat-1", b1.id).unwrap();
        let loaded = store.load_chat("chat-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, b2.id);
    }

    #[test]
    fn load_missing_chat_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PerceptualStore::new(tmp.path()).unwrap();
        assert!(store.load_chat("nope").unwrap().is_empty());
    }
}
