//! Block tracker — maintains a sliding window of accepted blocks
//! for parent-hash chain verification and reorg walks.

use std::collections::VecDeque;

use crate::error::IndexerError;
use crate::types::BlockRef;

/// Tracks the last N accepted blocks to enable reorg detection.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the previous block. A mismatch means a reorg occurred.
#[derive(Debug)]
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockRef>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Start tracking from `block` without a linkage check (the cursor block
    /// on startup).
    pub fn seed(&mut self, block: BlockRef) {
        self.window.clear();
        self.window.push_back(block);
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `ReorgDetected` if the block does not extend the current head.
    pub fn push(&mut self, block: BlockRef) -> Result<(), IndexerError> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(IndexerError::ReorgDetected {
                    block_number: block.number,
                    expected: head.hash,
                    actual: block.parent_hash,
                });
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Returns the current head (most recently accepted block).
    pub fn head(&self) -> Option<&BlockRef> {
        self.window.back()
    }

    /// Returns the oldest block still in the window.
    pub fn oldest(&self) -> Option<&BlockRef> {
        self.window.front()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&BlockRef> {
        let oldest = self.window.front()?.number;
        let idx = number.checked_sub(oldest)? as usize;
        self.window.get(idx).filter(|b| b.number == number)
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Rewind the tracker to a given block number (discard everything after it).
    ///
    /// Returns the dropped blocks, most recent first.
    pub fn rewind_to(&mut self, block_number: u64) -> Vec<BlockRef> {
        let mut dropped = Vec::new();
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                dropped.extend(self.window.pop_back());
            } else {
                break;
            }
        }
        dropped
    }
}
