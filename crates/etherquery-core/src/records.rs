//! Normalized output records — one row each in the warehouse.

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BlockRef, TxStatus};

// ─── RecordKind ──────────────────────────────────────────────────────────────

/// The logical table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Block,
    Transaction,
    Log,
}

impl RecordKind {
    /// Table name in the warehouse dataset.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Block => "blocks",
            Self::Transaction => "transactions",
            Self::Log => "logs",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Transaction => write!(f, "transaction"),
            Self::Log => write!(f, "log"),
        }
    }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// One row per canonical block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: DateTime<Utc>,
    pub miner: Address,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub transaction_count: u32,
}

impl BlockRecord {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
        }
    }
}

/// One row per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u32,
    pub hash: B256,
    pub nonce: u64,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    pub gas_used: u64,
    pub status: TxStatus,
    pub contract_address: Option<Address>,
}

/// One row per emitted log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u32,
    pub log_index: u32,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Any exported row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Block(BlockRecord),
    Transaction(TransactionRecord),
    Log(LogRecord),
}

/// Natural key of a row: repeated inserts of the same key are the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub block_hash: B256,
    pub kind: RecordKind,
    pub index: u32,
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}-{}-{}", self.block_hash, self.kind, self.index)
    }
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Block(_) => RecordKind::Block,
            Self::Transaction(_) => RecordKind::Transaction,
            Self::Log(_) => RecordKind::Log,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Self::Block(b) => b.number,
            Self::Transaction(t) => t.block_number,
            Self::Log(l) => l.block_number,
        }
    }

    pub fn block_hash(&self) -> B256 {
        match self {
            Self::Block(b) => b.hash,
            Self::Transaction(t) => t.block_hash,
            Self::Log(l) => l.block_hash,
        }
    }

    /// Index within the block (0 for the block row itself).
    pub fn index(&self) -> u32 {
        match self {
            Self::Block(_) => 0,
            Self::Transaction(t) => t.transaction_index,
            Self::Log(l) => l.log_index,
        }
    }

    /// The sink's dedupe key: `(block hash, kind, index)`.
    pub fn key(&self) -> RowKey {
        RowKey {
            block_hash: self.block_hash(),
            kind: self.kind(),
            index: self.index(),
        }
    }
}

// ─── ExtractedBlock ──────────────────────────────────────────────────────────

/// Every record produced from one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedBlock {
    pub block: BlockRecord,
    /// Ordered by transaction index.
    pub transactions: Vec<TransactionRecord>,
    /// Ordered by transaction, then log index.
    pub logs: Vec<LogRecord>,
}

impl ExtractedBlock {
    pub fn block_ref(&self) -> BlockRef {
        self.block.block_ref()
    }

    /// Total rows, including the block row.
    pub fn record_count(&self) -> usize {
        1 + self.transactions.len() + self.logs.len()
    }

    /// Flatten into export order: block, then transactions, then logs.
    pub fn into_records(self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.record_count());
        records.push(Record::Block(self.block));
        records.extend(self.transactions.into_iter().map(Record::Transaction));
        records.extend(self.logs.into_iter().map(Record::Log));
        records
    }
}
