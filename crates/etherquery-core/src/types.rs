//! Raw chain types handed over by the chain feed.
//!
//! These mirror what the host node stores: header numeric fields keep the
//! node's native 256-bit precision, narrowing happens in the extractor.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

// ─── BlockRef ────────────────────────────────────────────────────────────────

/// The identity of a block — enough to verify parent linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block height.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
}

impl BlockRef {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({:#x})", self.number, self.hash)
    }
}

// ─── Raw block ───────────────────────────────────────────────────────────────

/// A block header as stored by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix timestamp (seconds).
    pub timestamp: U256,
    /// Block author / coinbase.
    pub miner: Address,
    pub gas_used: U256,
    pub gas_limit: U256,
}

/// A transaction as included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: B256,
    pub nonce: u64,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    /// Gas limit supplied by the sender.
    pub gas: U256,
    pub input: Bytes,
}

/// A full block: header plus its ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub header: RawHeader,
    pub transactions: Vec<RawTransaction>,
}

impl RawBlock {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash
    }

    /// The block's identity for linkage checks.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.header.number,
            hash: self.header.hash,
            parent_hash: self.header.parent_hash,
        }
    }
}

// ─── Receipts ────────────────────────────────────────────────────────────────

/// Outcome of a transaction's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
    /// Pre-Byzantium receipts carry a state root instead of a status code.
    Unknown,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// A log entry emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Position of the log within the block.
    pub log_index: u64,
}

/// A transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReceipt {
    pub transaction_hash: B256,
    pub status: TxStatus,
    pub gas_used: U256,
    /// Set when the transaction created a contract.
    pub contract_address: Option<Address>,
    pub logs: Vec<RawLog>,
}

/// A block together with the receipts of its transactions (same order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWithReceipts {
    pub block: RawBlock,
    pub receipts: Vec<RawReceipt>,
}

impl BlockWithReceipts {
    pub fn new(block: RawBlock, receipts: Vec<RawReceipt>) -> Self {
        Self { block, receipts }
    }

    pub fn number(&self) -> u64 {
        self.block.number()
    }

    pub fn hash(&self) -> B256 {
        self.block.hash()
    }

    pub fn block_ref(&self) -> BlockRef {
        self.block.block_ref()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
