//! JSON file cursor store.
//!
//! All checkpoints live in one JSON object keyed by cursor key. Saves write
//! the whole document to `<path>.tmp` and rename it over `<path>`, so a crash
//! mid-write leaves the previous cursor intact.
//!
//! # Usage
//! ```rust,no_run
//! use etherquery_storage::FileCursorStore;
//!
//! let store = FileCursorStore::new("./etherquery-cursor.json");
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use etherquery_core::checkpoint::{Checkpoint, CursorStore};
use etherquery_core::error::IndexerError;

type Document = BTreeMap<String, Checkpoint>;

/// File-backed cursor store.
pub struct FileCursorStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn read(&self) -> Result<Document, IndexerError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(storage_error(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Document::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| IndexerError::CorruptCursor {
            key: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn write(&self, doc: &Document) -> Result<(), IndexerError> {
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| storage_error(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage_error(&self.path, e))
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> IndexerError {
    IndexerError::Storage(format!("{}: {e}", path.display()))
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.remove(key))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        let key = checkpoint.key.clone();
        let block = checkpoint.cursor.block_number;
        doc.insert(key.clone(), checkpoint);
        self.write(&doc).await?;
        debug!(key = %key, block, path = %self.path.display(), "cursor saved");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IndexerError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        if doc.remove(key).is_some() {
            self.write(&doc).await?;
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
