//! Checkpoint storage
//!
//! A [`Checkpoint`] is the globally consistent state of one rule: an opaque
//! snapshot per operator plus the offset of every source. The coordinator
//! writes a checkpoint once every node has acknowledged its barrier and
//! prunes older ones, so a store normally holds only the latest complete
//! checkpoint.
//!
//! # Example
//! ```
//! use rill_runtime::persistence::{Checkpoint, MemoryStore, StateStore};
//!
//! let store = MemoryStore::new();
//! store.save_checkpoint(&Checkpoint::new(1000)).unwrap();
//! assert_eq!(store.load_latest_checkpoint().unwrap().unwrap().id, 1000);
//! ```

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

const CHECKPOINT_PREFIX: &str = "checkpoint:";

/// Complete state of a rule at one barrier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Barrier id, the coordinator tick time in milliseconds.
    pub id: i64,
    /// Time the checkpoint completed
    pub timestamp_ms: i64,
    /// Operator snapshots by operator id
    #[serde(default)]
    pub op_states: BTreeMap<String, serde_json::Value>,
    /// Source offsets by source id
    #[serde(default)]
    pub offsets: BTreeMap<String, serde_json::Value>,
}

impl Checkpoint {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

/// Trait for state storage backends
pub trait StateStore: Send + Sync {
    /// Store a checkpoint
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let data = serde_json::to_vec(checkpoint)?;
        self.put(&format!("{}{}", CHECKPOINT_PREFIX, checkpoint.id), &data)
    }

    /// Load the latest checkpoint
    fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        match self.list_checkpoints()?.last() {
            Some(id) => self.load_checkpoint(*id),
            None => Ok(None),
        }
    }

    /// Load a specific checkpoint by ID
    fn load_checkpoint(&self, id: i64) -> Result<Option<Checkpoint>, StoreError> {
        match self.get(&format!("{}{}", CHECKPOINT_PREFIX, id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// List all checkpoint IDs in ascending order
    fn list_checkpoints(&self) -> Result<Vec<i64>, StoreError>;

    /// Delete old checkpoints, keeping only the most recent `keep`
    fn prune_checkpoints(&self, keep: usize) -> Result<usize, StoreError> {
        let checkpoints = self.list_checkpoints()?;
        let to_delete = checkpoints.len().saturating_sub(keep);
        for id in checkpoints.iter().take(to_delete) {
            self.delete(&format!("{}{}", CHECKPOINT_PREFIX, id))?;
        }
        if to_delete > 0 {
            debug!("Pruned {} checkpoints", to_delete);
        }
        Ok(to_delete)
    }

    /// Store arbitrary key-value data
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Retrieve arbitrary key-value data
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Flush all pending writes
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory state store, shared between runs of a rule in tests
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Io(e.to_string())
}

impl StateStore for MemoryStore {
    fn list_checkpoints(&self) -> Result<Vec<i64>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let mut ids: Vec<i64> = data
            .keys()
            .filter_map(|k| k.strip_prefix(CHECKPOINT_PREFIX).and_then(|s| s.parse().ok()))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(key);
        Ok(())
    }
}

/// File-system based state store
///
/// Stores key-value pairs as files in a directory. Keys containing ":"
/// are mapped to subdirectories (e.g., "checkpoint:42" → "checkpoint/42").
/// Writes are atomic via temp file + rename.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open or create a file-based store at the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(key.replace(':', std::path::MAIN_SEPARATOR_STR))
    }
}

impl StateStore for FileStore {
    fn list_checkpoints(&self) -> Result<Vec<i64>, StoreError> {
        let checkpoint_dir = self.dir.join("checkpoint");
        if !checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&checkpoint_dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.key_to_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
