//! etherquery-core — reorg-safe export of Ethereum blocks, transactions and
//! logs to an analytical warehouse.
//!
//! # Architecture
//!
//! ```text
//! ChainFeed ──► IndexerService loop
//!                   ├── BlockTracker      (parent hash chain, reorg window)
//!                   ├── extractor         (raw block + receipts → records)
//!                   ├── BatchBuffer       (size-or-age batching)
//!                   ├── WarehouseExporter (retrying bulk writes) ──► WarehouseSink
//!                   ├── reorg             (common-ancestor walk)
//!                   └── CursorManager     (persisted cursor) ──► CursorStore
//! ```

pub mod buffer;
pub mod builder;
pub mod checkpoint;
pub mod cursor;
pub mod error;
pub mod exporter;
pub mod extractor;
pub mod feed;
pub mod indexer;
pub mod records;
pub mod reorg;
pub mod retry;
pub mod service;
pub mod tracker;
pub mod types;

pub use buffer::{BatchBuffer, ExportBatch};
pub use builder::ServiceBuilder;
pub use checkpoint::{Checkpoint, CursorManager, CursorStore, MemoryCursorStore};
pub use cursor::Cursor;
pub use error::{ErrorKind, IndexerError};
pub use exporter::{ExportReport, MemorySink, SinkError, WarehouseExporter, WarehouseSink};
pub use extractor::{extract, ExtractError};
pub use feed::{BlockStream, ChainFeed, MemoryChainFeed};
pub use indexer::{IndexerState, ServiceConfig};
pub use records::{
    BlockRecord, ExtractedBlock, LogRecord, Record, RecordKind, RowKey, TransactionRecord,
};
pub use reorg::ReorgEvent;
pub use retry::{RetryConfig, RetryPolicy};
pub use service::{IndexerService, Service, ServiceMetrics};
pub use tracker::BlockTracker;
pub use types::{
    BlockRef, BlockWithReceipts, RawBlock, RawHeader, RawLog, RawReceipt, RawTransaction,
    TxStatus,
};
