//! # etherquery-observability
//!
//! Structured logging for EtherQuery.
//!
//! Every crate logs through `tracing` macros with structured fields
//! (`block`, `first`, `last`, `rows`, `attempt`, ...). This crate installs
//! the subscriber: an `EnvFilter` built from a global level plus
//! per-component overrides, and text or JSON output (ELK, Loki, Cloud
//! Logging).

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogConfig};
