//! Record extractor — turns a raw block and its receipts into rows.
//!
//! Pure: the output depends only on the inputs. Narrowing a 256-bit chain
//! value into a `u64` column is checked; a value that does not fit is an
//! error, never a silent truncation.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::records::{BlockRecord, ExtractedBlock, LogRecord, TransactionRecord};
use crate::types::{RawBlock, RawReceipt};

/// Reasons a block cannot be turned into records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("{field} = {value} does not fit in {target}")]
    Overflow {
        field: &'static str,
        value: String,
        target: &'static str,
    },

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(U256),

    #[error("receipts do not match transactions: {0}")]
    ReceiptMismatch(String),
}

/// Extract the block, transaction and log records of `block`.
///
/// `receipts` must be in transaction order, one per transaction.
pub fn extract(block: &RawBlock, receipts: &[RawReceipt]) -> Result<ExtractedBlock, ExtractError> {
    let header = &block.header;

    if receipts.len() != block.transactions.len() {
        return Err(ExtractError::ReceiptMismatch(format!(
            "{} transactions, {} receipts",
            block.transactions.len(),
            receipts.len()
        )));
    }

    let block_record = BlockRecord {
        number: header.number,
        hash: header.hash,
        parent_hash: header.parent_hash,
        timestamp: timestamp(header.timestamp)?,
        miner: header.miner,
        gas_used: narrow_u64("gas_used", header.gas_used)?,
        gas_limit: narrow_u64("gas_limit", header.gas_limit)?,
        transaction_count: narrow_u32("transaction_count", block.transactions.len() as u64)?,
    };

    let mut transactions = Vec::with_capacity(block.transactions.len());
    let mut logs = Vec::new();

    for (i, (tx, receipt)) in block.transactions.iter().zip(receipts).enumerate() {
        if tx.hash != receipt.transaction_hash {
            return Err(ExtractError::ReceiptMismatch(format!(
                "receipt {i} is for {:#x}, transaction is {:#x}",
                receipt.transaction_hash, tx.hash
            )));
        }
        let transaction_index = narrow_u32("transaction_index", i as u64)?;

        transactions.push(TransactionRecord {
            block_number: header.number,
            block_hash: header.hash,
            transaction_index,
            hash: tx.hash,
            nonce: tx.nonce,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas_price: tx.gas_price,
            gas_used: narrow_u64("receipt.gas_used", receipt.gas_used)?,
            status: receipt.status,
            contract_address: receipt.contract_address,
        });

        for log in &receipt.logs {
            logs.push(LogRecord {
                block_number: header.number,
                block_hash: header.hash,
                transaction_hash: tx.hash,
                transaction_index,
                log_index: narrow_u32("log_index", log.log_index)?,
                address: log.address,
                topics: log.topics.clone(),
                data: log.data.clone(),
            });
        }
    }

    Ok(ExtractedBlock {
        block: block_record,
        transactions,
        logs,
    })
}

fn narrow_u64(field: &'static str, value: U256) -> Result<u64, ExtractError> {
    u64::try_from(value).map_err(|_| ExtractError::Overflow {
        field,
        value: value.to_string(),
        target: "u64",
    })
}

fn narrow_u32(field: &'static str, value: u64) -> Result<u32, ExtractError> {
    u32::try_from(value).map_err(|_| ExtractError::Overflow {
        field,
        value: value.to_string(),
        target: "u32",
    })
}

fn timestamp(value: U256) -> Result<DateTime<Utc>, ExtractError> {
    let secs = u64::try_from(value)
        .ok()
        .and_then(|s| i64::try_from(s).ok())
        .ok_or(ExtractError::InvalidTimestamp(value))?;
    DateTime::from_timestamp(secs, 0).ok_or(ExtractError::InvalidTimestamp(value))
}
