//! Error types for the export pipeline.

use alloy_primitives::B256;
use thiserror::Error;

use crate::exporter::SinkError;
use crate::extractor::ExtractError;
use crate::indexer::IndexerState;

/// How the service reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff inside the exporter or the block loop.
    Transient,
    /// A reorg — handled by reconciliation, never surfaced as a failure.
    Divergence,
    /// Stops the service and is reported to the host.
    Fatal,
}

/// Errors that can occur while indexing and exporting.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("block not available: {0}")]
    NotAvailable(String),

    #[error("chain feed error: {0}")]
    Feed(String),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("export of blocks {first}..={last} failed after {attempts} attempts: {source}")]
    ExportFailed {
        first: u64,
        last: u64,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("failed to extract block {block_number}: {source}")]
    Extract {
        block_number: u64,
        #[source]
        source: ExtractError,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("corrupt cursor '{key}': {reason}")]
    CorruptCursor { key: String, reason: String },

    #[error("Reorg detected at block {block_number}: expected parent {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: B256,
        actual: B256,
    },

    #[error("no common ancestor within {max_depth} blocks below block {block_number}")]
    ReorgTooDeep { block_number: u64, max_depth: u64 },

    #[error("block {got} appended after block {last}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("service is {state}")]
    InvalidState { state: IndexerState },

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },
}

impl IndexerError {
    /// Classify the error for the retry / reconcile / stop decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAvailable(_) | Self::Feed(_) => ErrorKind::Transient,
            Self::Sink(e) if e.is_retryable() => ErrorKind::Transient,
            Self::ReorgDetected { .. } => ErrorKind::Divergence,
            _ => ErrorKind::Fatal,
        }
    }

    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        self.kind() == ErrorKind::Divergence
    }

    /// Returns `true` if the service must stop.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
