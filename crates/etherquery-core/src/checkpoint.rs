//! Cursor checkpoints — persist the export position across restarts.
//!
//! A checkpoint stores the last exported block number and hash, plus a
//! format version. On restart the service resumes from the checkpoint rather
//! than re-exporting from genesis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::IndexerError;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A persisted cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `"{project}:{dataset}"`.
    pub key: String,
    /// Format version; readers reject versions they do not know.
    pub version: u32,
    pub cursor: Cursor,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(key: impl Into<String>, cursor: Cursor) -> Self {
        Self {
            key: key.into(),
            version: CHECKPOINT_VERSION,
            cursor,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Reject checkpoints written in an unknown format.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(IndexerError::CorruptCursor {
                key: self.key.clone(),
                reason: format!("unsupported checkpoint version {}", self.version),
            });
        }
        Ok(())
    }
}

/// Trait for storing and loading cursor checkpoints.
///
/// Implementations include `MemoryCursorStore` and, in `etherquery-storage`,
/// `FileCursorStore` and `SqliteCursorStore`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the checkpoint saved under `key`.
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting the service).
    async fn delete(&self, key: &str) -> Result<(), IndexerError>;
}

/// Owns the service's cursor and its persistence.
pub struct CursorManager {
    store: Arc<dyn CursorStore>,
    key: String,
    current: Option<Cursor>,
}

impl CursorManager {
    pub fn new(store: Arc<dyn CursorStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            current: None,
        }
    }

    /// Load the saved cursor (returns `None` if none exists).
    pub async fn load(&mut self) -> Result<Option<Cursor>, IndexerError> {
        let loaded = match self.store.load(&self.key).await? {
            Some(cp) => {
                cp.validate()?;
                if cp.key != self.key {
                    return Err(IndexerError::CorruptCursor {
                        key: self.key.clone(),
                        reason: format!("checkpoint belongs to '{}'", cp.key),
                    });
                }
                Some(cp.cursor)
            }
            None => None,
        };
        self.current = loaded;
        Ok(loaded)
    }

    /// The cursor as last loaded or saved.
    pub fn current(&self) -> Option<Cursor> {
        self.current
    }

    /// Move the cursor forward and persist it.
    ///
    /// Moving backwards is refused; use [`CursorManager::rewind`] for reorgs.
    pub async fn advance(&mut self, cursor: Cursor) -> Result<(), IndexerError> {
        if let Some(current) = self.current {
            if cursor.block_number < current.block_number {
                return Err(IndexerError::OutOfOrder {
                    last: current.block_number,
                    got: cursor.block_number,
                });
            }
        }
        self.persist(cursor).await
    }

    /// Move the cursor back after a reorg superseded exported blocks.
    pub async fn rewind(&mut self, cursor: Cursor) -> Result<(), IndexerError> {
        self.persist(cursor).await
    }

    /// Write the current cursor again (used on shutdown).
    pub async fn flush(&self) -> Result<(), IndexerError> {
        match self.current {
            Some(cursor) => self.store.save(Checkpoint::new(&self.key, cursor)).await,
            None => Ok(()),
        }
    }

    async fn persist(&mut self, cursor: Cursor) -> Result<(), IndexerError> {
        self.store.save(Checkpoint::new(&self.key, cursor)).await?;
        self.current = Some(cursor);
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory cursor store for tests and ephemeral services.
#[derive(Default)]
pub struct MemoryCursorStore {
    data: Mutex<HashMap<String, Checkpoint>>,
    saves: Mutex<u64>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.data
            .lock()
            .unwrap()
            .insert(checkpoint.key.clone(), checkpoint);
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IndexerError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}
