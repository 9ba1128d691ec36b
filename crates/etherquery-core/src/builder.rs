//! Fluent builder API for creating export services.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use etherquery_core::{MemoryChainFeed, MemorySink, ServiceBuilder};
//!
//! let service = ServiceBuilder::new()
//!     .project("my-gcp-project")
//!     .dataset("mainnet")
//!     .batch_size(1_000)
//!     .batch_interval_ms(10_000)
//!     .feed(Arc::new(MemoryChainFeed::new()))
//!     .sink(Arc::new(MemorySink::new()))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

use crate::checkpoint::{CursorStore, MemoryCursorStore};
use crate::error::IndexerError;
use crate::exporter::WarehouseSink;
use crate::feed::ChainFeed;
use crate::indexer::ServiceConfig;
use crate::service::IndexerService;

/// Fluent builder for `ServiceConfig` and `IndexerService`.
#[derive(Default)]
pub struct ServiceBuilder {
    config: ServiceConfig,
    feed: Option<Arc<dyn ChainFeed>>,
    store: Option<Arc<dyn CursorStore>>,
    sink: Option<Arc<dyn WarehouseSink>>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. loaded from YAML).
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the warehouse project.
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.config.project = project.into();
        self
    }

    /// Set the warehouse dataset.
    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.config.dataset = dataset.into();
        self
    }

    /// Set the maximum age of buffered records, in milliseconds.
    pub fn batch_interval_ms(mut self, ms: u64) -> Self {
        self.config.batch_interval_ms = ms;
        self
    }

    /// Set the number of records that triggers a flush.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the first block to export when no cursor exists.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set how deep a reorg may reach before the service stops.
    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set export retry behavior.
    pub fn export_retries(mut self, max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.config.export_max_retries = max_retries;
        self.config.export_initial_backoff_ms = initial_backoff_ms;
        self.config.export_max_backoff_ms = max_backoff_ms;
        self
    }

    /// Set the bound on the final flush during shutdown, in milliseconds.
    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    /// Set the delay before re-subscribing to a dropped feed, in milliseconds.
    pub fn resubscribe_backoff_ms(mut self, ms: u64) -> Self {
        self.config.resubscribe_backoff_ms = ms;
        self
    }

    pub fn feed(mut self, feed: Arc<dyn ChainFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Set the cursor store. Defaults to an in-memory store.
    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn WarehouseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the `ServiceConfig`.
    pub fn build_config(self) -> ServiceConfig {
        self.config
    }

    /// Validate the configuration and build the service.
    pub fn build(self) -> Result<IndexerService, IndexerError> {
        self.config.validate()?;
        let feed = self
            .feed
            .ok_or_else(|| IndexerError::Config("a chain feed is required".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| IndexerError::Config("a warehouse sink is required".into()))?;
        let store = match self.store {
            Some(store) => store,
            None => {
                tracing::warn!("no cursor store configured, the cursor will not survive a restart");
                Arc::new(MemoryCursorStore::new())
            }
        };
        Ok(IndexerService::new(self.config, feed, store, sink))
    }
}
