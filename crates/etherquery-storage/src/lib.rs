//! etherquery-storage — persistent cursor stores for the export service.
//!
//! Backends:
//! - [`file`] — one JSON document, replaced atomically on every save
//! - [`sqlite`] — SQLite via `sqlx` (feature `sqlite`)
//!
//! The in-memory store lives in `etherquery-core` as `MemoryCursorStore`.

pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileCursorStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCursorStore;
