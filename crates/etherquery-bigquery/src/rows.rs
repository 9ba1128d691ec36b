//! Record → BigQuery JSON row encoding.
//!
//! 256-bit quantities (`value`, `gas_price`) do not fit BigQuery's INT64 or
//! NUMERIC columns and are written as decimal strings. Hashes, addresses and
//! byte strings are `0x`-prefixed lowercase hex; timestamps are RFC 3339 UTC.

use alloy_primitives::hex;
use chrono::SecondsFormat;
use serde_json::{json, Value};

use etherquery_core::records::{BlockRecord, LogRecord, Record, TransactionRecord};

/// Encode one record as the `json` object of an `insertAll` row.
pub fn encode(record: &Record) -> Value {
    match record {
        Record::Block(b) => block_row(b),
        Record::Transaction(tx) => transaction_row(tx),
        Record::Log(log) => log_row(log),
    }
}

fn block_row(b: &BlockRecord) -> Value {
    json!({
        "number": b.number,
        "hash": hex::encode_prefixed(b.hash),
        "parent_hash": hex::encode_prefixed(b.parent_hash),
        "timestamp": b.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        "miner": hex::encode_prefixed(b.miner),
        "gas_used": b.gas_used,
        "gas_limit": b.gas_limit,
        "transaction_count": b.transaction_count,
    })
}

fn transaction_row(tx: &TransactionRecord) -> Value {
    json!({
        "block_number": tx.block_number,
        "block_hash": hex::encode_prefixed(tx.block_hash),
        "transaction_index": tx.transaction_index,
        "hash": hex::encode_prefixed(tx.hash),
        "nonce": tx.nonce,
        "from": hex::encode_prefixed(tx.from),
        "to": tx.to.map(hex::encode_prefixed),
        "value": tx.value.to_string(),
        "gas_price": tx.gas_price.to_string(),
        "gas_used": tx.gas_used,
        "status": tx.status.as_str(),
        "contract_address": tx.contract_address.map(hex::encode_prefixed),
    })
}

fn log_row(log: &LogRecord) -> Value {
    let topics: Vec<String> = log.topics.iter().map(hex::encode_prefixed).collect();
    json!({
        "block_number": log.block_number,
        "block_hash": hex::encode_prefixed(log.block_hash),
        "transaction_hash": hex::encode_prefixed(log.transaction_hash),
        "transaction_index": log.transaction_index,
        "log_index": log.log_index,
        "address": hex::encode_prefixed(log.address),
        "topics": topics,
        "data": hex::encode_prefixed(&log.data),
    })
}
