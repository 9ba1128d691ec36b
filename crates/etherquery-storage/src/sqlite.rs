//! SQLite cursor store.
//!
//! Persists cursors to a single SQLite file, one row per cursor key.
//! Uses `sqlx` with WAL mode so `etherquery cursor show` can read while the
//! service writes.
//!
//! # Usage
//! ```rust,no_run
//! use etherquery_storage::sqlite::SqliteCursorStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteCursorStore::open("./etherquery.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteCursorStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use alloy_primitives::B256;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use etherquery_core::checkpoint::{Checkpoint, CursorStore};
use etherquery_core::cursor::Cursor;
use etherquery_core::error::IndexerError;

fn db_error(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed cursor store.
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./etherquery.db"`) or a full
    /// SQLite URL (`"sqlite:./etherquery.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_error)?;
        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // One connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_error)?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), IndexerError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                cursor_key   TEXT    NOT NULL PRIMARY KEY,
                version      INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT cursor_key, version, block_number, block_hash, updated_at
             FROM cursors WHERE cursor_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| IndexerError::CorruptCursor {
            key: key.to_string(),
            reason,
        };
        let hash: String = row.get("block_hash");
        let block_hash =
            B256::from_str(&hash).map_err(|e| corrupt(format!("bad block hash '{hash}': {e}")))?;
        let block_number = u64::try_from(row.get::<i64, _>("block_number"))
            .map_err(|e| corrupt(format!("bad block number: {e}")))?;
        let version = u32::try_from(row.get::<i64, _>("version"))
            .map_err(|e| corrupt(format!("bad version: {e}")))?;

        Ok(Some(Checkpoint {
            key: row.get("cursor_key"),
            version,
            cursor: Cursor::new(block_number, block_hash),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let block_number = i64::try_from(checkpoint.cursor.block_number)
            .map_err(|e| IndexerError::Storage(format!("block number out of range: {e}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO cursors
             (cursor_key, version, block_number, block_hash, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.key)
        .bind(i64::from(checkpoint.version))
        .bind(block_number)
        .bind(format!("{:#x}", checkpoint.cursor.block_hash))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!(
            key = %checkpoint.key,
            block = checkpoint.cursor.block_number,
            "cursor saved"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM cursors WHERE cursor_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(key: &str, block: u64, byte: u8) -> Checkpoint {
        Checkpoint::new(key, Cursor::new(block, B256::repeat_byte(byte)))
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = SqliteCursorStore::in_memory().await.unwrap();

        let cp = checkpoint("etherquery:ethereum", 1_000, 0xab);
        store.save(cp.clone()).await.unwrap();

        let loaded = store.load("etherquery:ethereum").await.unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn checkpoint_upsert() {
        let store = SqliteCursorStore::in_memory().await.unwrap();

        store.save(checkpoint("p:d", 100, 0x01)).await.unwrap();
        store.save(checkpoint("p:d", 200, 0x02)).await.unwrap();

        // Only one row; second save overwrites the first
        let loaded = store.load("p:d").await.unwrap().unwrap();
        assert_eq!(loaded.cursor, Cursor::new(200, B256::repeat_byte(0x02)));
    }

    #[tokio::test]
    async fn checkpoint_missing_returns_none() {
        let store = SqliteCursorStore::in_memory().await.unwrap();
        assert!(store.load("unknown:dataset").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_delete() {
        let store = SqliteCursorStore::in_memory().await.unwrap();
        store.save(checkpoint("p:d", 500, 0x05)).await.unwrap();
        assert!(store.load("p:d").await.unwrap().is_some());

        store.delete("p:d").await.unwrap();
        assert!(store.load("p:d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_hash_is_corrupt() {
        let store = SqliteCursorStore::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO cursors (cursor_key, version, block_number, block_hash, updated_at)
             VALUES ('p:d', 1, 5, 'not-a-hash', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.load("p:d").await.unwrap_err();
        assert!(matches!(err, IndexerError::CorruptCursor { .. }));
    }
}
