//! Export cursor — the last block known to be durably in the warehouse.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::types::BlockRef;

/// The service's position in the chain.
///
/// Everything at or below `block_number` on the chain identified by
/// `block_hash` has been written to the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last exported block number.
    pub block_number: u64,
    /// Last exported block hash.
    pub block_hash: B256,
}

impl Cursor {
    pub fn new(block_number: u64, block_hash: B256) -> Self {
        Self {
            block_number,
            block_hash,
        }
    }

    /// Advance the cursor to a newly exported block.
    pub fn advance(&mut self, block_number: u64, block_hash: B256) {
        self.block_number = block_number;
        self.block_hash = block_hash;
    }

    /// Returns the next block to export (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block_number + 1
    }

    /// Returns `true` if `block` is the block the cursor points at.
    pub fn matches(&self, block: &BlockRef) -> bool {
        self.block_number == block.number && self.block_hash == block.hash
    }
}

impl From<BlockRef> for Cursor {
    fn from(block: BlockRef) -> Self {
        Self::new(block.number, block.hash)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({:#x})", self.block_number, self.block_hash)
    }
}
