//! Batch buffer — accumulates whole blocks of records and decides when to flush.
//!
//! A flush is due when the buffered record count reaches `max_records`, or
//! when the oldest buffered record has waited `max_age`, whichever comes
//! first. Blocks are never split across batches.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::IndexerError;
use crate::records::{ExtractedBlock, Record};
use crate::types::BlockRef;

/// A drained batch on its way to the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBatch {
    /// Records in export order (ascending block height).
    pub records: Vec<Record>,
    /// First block covered by the batch.
    pub first_block: BlockRef,
    /// Last block covered by the batch; the cursor moves here on success.
    pub last_block: BlockRef,
    /// Number of blocks in the batch.
    pub block_count: usize,
}

impl ExportBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Records of one buffered block.
#[derive(Debug)]
struct BufferedBlock {
    block: BlockRef,
    records: Vec<Record>,
}

/// In-memory size-or-time batching buffer.
#[derive(Debug)]
pub struct BatchBuffer {
    max_records: usize,
    max_age: Duration,
    blocks: Vec<BufferedBlock>,
    record_count: usize,
    /// When the oldest unflushed record was appended.
    oldest: Option<Instant>,
}

impl BatchBuffer {
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        Self {
            max_records,
            max_age,
            blocks: Vec::new(),
            record_count: 0,
            oldest: None,
        }
    }

    /// Append all records of one block.
    pub fn append(&mut self, block: ExtractedBlock) -> Result<(), IndexerError> {
        self.append_at(block, Instant::now())
    }

    /// Append all records of one block, as of `now`.
    ///
    /// Heights must be non-decreasing across appends.
    pub fn append_at(&mut self, block: ExtractedBlock, now: Instant) -> Result<(), IndexerError> {
        let block_ref = block.block_ref();
        if let Some(last) = self.last_block() {
            if block_ref.number < last.number {
                return Err(IndexerError::OutOfOrder {
                    last: last.number,
                    got: block_ref.number,
                });
            }
        }
        let records = block.into_records();
        self.record_count += records.len();
        self.oldest.get_or_insert(now);
        self.blocks.push(BufferedBlock {
            block: block_ref,
            records,
        });
        Ok(())
    }

    /// Returns `true` if a flush is due now.
    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    /// Returns `true` if `count ≥ max_records` or the oldest record is at
    /// least `max_age` old at `now`.
    pub fn should_flush_at(&self, now: Instant) -> bool {
        if self.record_count == 0 {
            return false;
        }
        if self.record_count >= self.max_records {
            return true;
        }
        match self.oldest {
            Some(oldest) => now.saturating_duration_since(oldest) >= self.max_age,
            None => false,
        }
    }

    /// Take everything buffered. Returns `None` if the buffer is empty.
    pub fn drain(&mut self) -> Option<ExportBatch> {
        let first_block = self.blocks.first()?.block;
        let last_block = self.blocks.last()?.block;
        let block_count = self.blocks.len();

        let mut records = Vec::with_capacity(self.record_count);
        for buffered in self.blocks.drain(..) {
            records.extend(buffered.records);
        }
        self.record_count = 0;
        self.oldest = None;

        Some(ExportBatch {
            records,
            first_block,
            last_block,
            block_count,
        })
    }

    /// Drop every buffered block above `block_number` (reorg recovery).
    ///
    /// Returns the number of records discarded. The age of the remaining
    /// records is kept.
    pub fn discard_after(&mut self, block_number: u64) -> usize {
        let mut discarded = 0;
        while let Some(last) = self.blocks.last() {
            if last.block.number <= block_number {
                break;
            }
            if let Some(dropped) = self.blocks.pop() {
                discarded += dropped.records.len();
            }
        }
        self.record_count -= discarded;
        if self.blocks.is_empty() {
            self.oldest = None;
        }
        discarded
    }

    /// The most recently buffered block.
    pub fn last_block(&self) -> Option<BlockRef> {
        self.blocks.last().map(|b| b.block)
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Number of buffered blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
