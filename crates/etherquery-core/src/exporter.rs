//! Warehouse exporter — writes batches to the sink with bounded retries.
//!
//! Delivery is at-least-once. A batch that was written but whose
//! acknowledgement was lost, or that is re-exported after a reorg, reaches
//! the sink again. Sinks must therefore merge rows by [`RowKey`]
//! (`block hash, kind, index`); BigQuery does this with `insertId`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::buffer::ExportBatch;
use crate::error::IndexerError;
use crate::records::{Record, RecordKind, RowKey};
use crate::retry::{RetryConfig, RetryPolicy};

/// Errors reported by a warehouse sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Connection refused, reset, DNS failure, 5xx.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The request timed out.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The warehouse asked us to slow down.
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// Some rows of the write failed; `failed` indexes into the written slice.
    #[error("{} rows failed: {reason}", failed.len())]
    Partial {
        failed: Vec<usize>,
        retryable: bool,
        reason: String,
    },

    /// The warehouse refused the write (bad schema, missing table, auth).
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Partial { retryable, .. } => *retryable,
            Self::Rejected(_) => false,
        }
    }
}

/// Bulk-insert interface of the analytical store.
///
/// Rows go to the `blocks`, `transactions` and `logs` tables according to
/// their [`RecordKind`]. Writing a row whose key already exists must not
/// produce a second logical row.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Human-readable sink name for logs.
    fn name(&self) -> &str;

    /// Write `records`. On partial failure, report the failed indexes.
    async fn write(&self, records: &[Record]) -> Result<(), SinkError>;
}

/// Outcome of a successful export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportReport {
    /// Write calls made, the successful one included.
    pub attempts: u32,
    /// Rows in the batch.
    pub rows: usize,
}

/// Writes export batches through a [`WarehouseSink`].
pub struct WarehouseExporter {
    sink: Arc<dyn WarehouseSink>,
    retry: RetryPolicy,
}

impl WarehouseExporter {
    pub fn new(sink: Arc<dyn WarehouseSink>, retry: RetryConfig) -> Self {
        Self {
            sink,
            retry: RetryPolicy::new(retry),
        }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Write `batch`, retrying transient failures with exponential backoff.
    ///
    /// After a partial failure only the failed rows are written again.
    /// Returns [`IndexerError::ExportFailed`] once the retry budget is spent
    /// or the sink reports a permanent error.
    pub async fn export(&self, batch: &ExportBatch) -> Result<ExportReport, IndexerError> {
        let first = batch.first_block.number;
        let last = batch.last_block.number;
        let mut pending: Option<Vec<Record>> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let rows = pending.as_deref().unwrap_or(&batch.records);
            let result = self.sink.write(rows).await;

            let err = match result {
                Ok(()) => {
                    tracing::debug!(
                        sink = self.sink.name(),
                        first,
                        last,
                        rows = batch.len(),
                        attempt,
                        "batch exported"
                    );
                    return Ok(ExportReport {
                        attempts: attempt,
                        rows: batch.len(),
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::error!(sink = self.sink.name(), first, last, error = %err, "export rejected");
                return Err(IndexerError::ExportFailed {
                    first,
                    last,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = match self.retry.next_delay(attempt) {
                Some(delay) => delay,
                None => {
                    tracing::error!(
                        sink = self.sink.name(),
                        attempt,
                        first,
                        last,
                        error = %err,
                        "max export retries exceeded"
                    );
                    return Err(IndexerError::ExportFailed {
                        first,
                        last,
                        attempts: attempt,
                        source: err,
                    });
                }
            };
            let delay = match &err {
                SinkError::RateLimited {
                    retry_after: Some(after),
                } => delay.max(*after),
                _ => delay,
            };

            if let SinkError::Partial { failed, .. } = &err {
                let retry_rows: Vec<Record> = failed
                    .iter()
                    .filter_map(|&i| rows.get(i).cloned())
                    .collect();
                if !retry_rows.is_empty() {
                    pending = Some(retry_rows);
                }
            }

            tracing::warn!(
                sink = self.sink.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                first,
                last,
                error = %err,
                "retrying export"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ─── In-memory sink (for testing) ─────────────────────────────────────────────

#[derive(Default)]
struct MemorySinkState {
    rows: BTreeMap<RowKey, Record>,
    write_calls: u64,
    successful_writes: u64,
    rows_received: u64,
    failures: VecDeque<SinkError>,
}

/// In-memory warehouse that merges rows by natural key.
///
/// Failures can be scripted with [`MemorySink::fail_next`]; each scripted
/// error is returned by one `write` call, in order.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write call fail with `error`.
    pub fn fail_next(&self, error: SinkError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    /// Number of `write` calls, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.state.lock().unwrap().write_calls
    }

    /// Number of `write` calls that succeeded.
    pub fn successful_writes(&self) -> u64 {
        self.state.lock().unwrap().successful_writes
    }

    /// Rows received by successful writes, duplicates included.
    pub fn rows_received(&self) -> u64 {
        self.state.lock().unwrap().rows_received
    }

    /// Distinct rows stored.
    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// Stored rows of one kind, ordered by block height then index.
    pub fn rows(&self, kind: RecordKind) -> Vec<Record> {
        let mut rows: Vec<Record> = self
            .state
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.block_number(), r.index()));
        rows
    }

    /// Returns `true` if a row with `key` is stored.
    pub fn contains(&self, key: &RowKey) -> bool {
        self.state.lock().unwrap().rows.contains_key(key)
    }
}

#[async_trait]
impl WarehouseSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, records: &[Record]) -> Result<(), SinkError> {
        let mut st = self.state.lock().unwrap();
        st.write_calls += 1;
        if let Some(err) = st.failures.pop_front() {
            // Rows outside a partial failure's `failed` set are accepted.
            if let SinkError::Partial { failed, .. } = &err {
                for (i, record) in records.iter().enumerate() {
                    if !failed.contains(&i) {
                        st.rows.insert(record.key(), record.clone());
                    }
                }
            }
            return Err(err);
        }
        st.successful_writes += 1;
        st.rows_received += records.len() as u64;
        for record in records {
            st.rows.insert(record.key(), record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BlockRecord;
    use crate::types::BlockRef;
    use alloy_primitives::{Address, B256, U256};
    use chrono::DateTime;

    fn block_record(number: u64) -> Record {
        Record::Block(BlockRecord {
            number,
            hash: B256::from(U256::from(number)),
            parent_hash: B256::from(U256::from(number - 1)),
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 0,
            transaction_count: 0,
        })
    }

    fn batch(range: std::ops::RangeInclusive<u64>) -> ExportBatch {
        let records: Vec<Record> = range.clone().map(block_record).collect();
        let r = |n: u64| BlockRef {
            number: n,
            hash: B256::from(U256::from(n)),
            parent_hash: B256::from(U256::from(n - 1)),
        };
        ExportBatch {
            block_count: records.len(),
            records,
            first_block: r(*range.start()),
            last_block: r(*range.end()),
        }
    }

    fn exporter(sink: Arc<MemorySink>, max_retries: u32) -> WarehouseExporter {
        WarehouseExporter::new(
            sink,
            RetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn export_writes_all_rows() {
        let sink = Arc::new(MemorySink::new());
        let report = exporter(sink.clone(), 3).export(&batch(1..=4)).await.unwrap();
        assert_eq!(report, ExportReport { attempts: 1, rows: 4 });
        assert_eq!(sink.row_count(), 4);
        assert_eq!(sink.successful_writes(), 1);
    }

    #[tokio::test]
    async fn single_transient_failure_then_success() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Http("connection reset".into()));

        let report = exporter(sink.clone(), 3).export(&batch(1..=2)).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(sink.write_calls(), 2);
        assert_eq!(sink.successful_writes(), 1);
        assert_eq!(sink.rows_received(), 2);
    }

    #[tokio::test]
    async fn retries_exactly_max_retries_times() {
        let sink = Arc::new(MemorySink::new());
        for _ in 0..10 {
            sink.fail_next(SinkError::Timeout { ms: 30_000 });
        }

        let err = exporter(sink.clone(), 3).export(&batch(5..=6)).await.unwrap_err();
        match err {
            IndexerError::ExportFailed {
                first,
                last,
                attempts,
                ..
            } => {
                assert_eq!((first, last), (5, 6));
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        // first try + 3 retries
        assert_eq!(sink.write_calls(), 4);
        assert_eq!(sink.successful_writes(), 0);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Rejected("no such table".into()));

        let err = exporter(sink.clone(), 5).export(&batch(1..=1)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn partial_failure_resends_only_failed_rows() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Partial {
            failed: vec![1, 3],
            retryable: true,
            reason: "backendError".into(),
        });

        let report = exporter(sink.clone(), 3).export(&batch(1..=4)).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(sink.row_count(), 4);
        // only the two failed rows were sent again
        assert_eq!(sink.rows_received(), 2);
    }

    #[tokio::test]
    async fn duplicate_rows_merge_by_key() {
        let sink = Arc::new(MemorySink::new());
        let exp = exporter(sink.clone(), 0);
        exp.export(&batch(1..=3)).await.unwrap();
        exp.export(&batch(2..=4)).await.unwrap();
        assert_eq!(sink.rows_received(), 6);
        assert_eq!(sink.row_count(), 4);
    }
}
