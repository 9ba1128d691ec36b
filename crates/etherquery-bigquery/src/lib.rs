//! etherquery-bigquery — writes exported records to BigQuery.
//!
//! Records go to the `blocks`, `transactions` and `logs` tables of the
//! configured dataset through the streaming `insertAll` API. Every row
//! carries its natural key as `insertId`, so a re-sent row is dropped by
//! BigQuery's best-effort deduplication.

pub mod client;
pub mod rows;

pub use client::{BigQueryConfig, BigQueryError, BigQuerySink};
