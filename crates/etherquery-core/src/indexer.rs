//! Service configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;

/// Configuration for an export service instance.
///
/// Immutable for the lifetime of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Warehouse project (GCP project ID for BigQuery).
    pub project: String,
    /// Warehouse dataset holding the `blocks`, `transactions` and `logs` tables.
    pub dataset: String,
    /// Flush when the oldest buffered record is this old (milliseconds).
    pub batch_interval_ms: u64,
    /// Flush when this many records are buffered.
    pub batch_size: usize,
    /// First block to export when no cursor has been persisted yet.
    pub start_block: u64,
    /// How far back a reorg may reach before the service gives up.
    /// Also the number of accepted blocks the tracker remembers.
    pub max_reorg_depth: u64,
    /// Retries per batch after the first failed attempt.
    pub export_max_retries: u32,
    /// Backoff before the first export retry (milliseconds).
    pub export_initial_backoff_ms: u64,
    /// Cap on the export backoff (milliseconds).
    pub export_max_backoff_ms: u64,
    /// Upper bound on the final flush during shutdown (milliseconds).
    pub shutdown_timeout_ms: u64,
    /// Delay before re-subscribing after the chain feed drops (milliseconds).
    pub resubscribe_backoff_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            project: "etherquery".into(),
            dataset: "ethereum".into(),
            batch_interval_ms: 15_000,
            batch_size: 500,
            start_block: 0,
            max_reorg_depth: 128,
            export_max_retries: 5,
            export_initial_backoff_ms: 500,
            export_max_backoff_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            resubscribe_backoff_ms: 1_000,
        }
    }
}

impl ServiceConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    /// Key under which the cursor is persisted.
    pub fn cursor_key(&self) -> String {
        format!("{}:{}", self.project, self.dataset)
    }

    /// Retry settings for the warehouse exporter.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.export_max_retries,
            initial_backoff: Duration::from_millis(self.export_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.export_max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.project.trim().is_empty() {
            return Err(IndexerError::Config("project must not be empty".into()));
        }
        if self.dataset.trim().is_empty() {
            return Err(IndexerError::Config("dataset must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be at least 1".into()));
        }
        if self.batch_interval_ms == 0 {
            return Err(IndexerError::Config("batch_interval_ms must be at least 1".into()));
        }
        if self.max_reorg_depth == 0 {
            return Err(IndexerError::Config("max_reorg_depth must be at least 1".into()));
        }
        if self.export_initial_backoff_ms > self.export_max_backoff_ms {
            return Err(IndexerError::Config(
                "export_initial_backoff_ms exceeds export_max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Runtime state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not running.
    Stopped,
    /// Loading the cursor and subscribing to the chain feed.
    Starting,
    /// Following the chain tip.
    Running,
    /// Recovering from a reorg.
    Reconciling,
    /// Flushing and shutting down.
    Stopping,
    /// Terminated by an unrecoverable error.
    Failed,
}

impl IndexerState {
    /// Returns `true` while the background loop is alive.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Reconciling | Self::Stopping)
    }
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.project, "etherquery");
        assert_eq!(cfg.dataset, "ethereum");
        assert_eq!(cfg.batch_interval(), Duration::from_secs(15));
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.cursor_key(), "etherquery:ethereum");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: ServiceConfig =
            serde_json::from_str(r#"{ "project": "analytics", "batch_size": 50 }"#).unwrap();
        assert_eq!(cfg.project, "analytics");
        assert_eq!(cfg.dataset, "ethereum");
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.batch_interval_ms, 15_000);
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let cfg = ServiceConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(IndexerError::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_dataset() {
        let cfg = ServiceConfig {
            dataset: " ".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_config_from_service_config() {
        let cfg = ServiceConfig {
            export_max_retries: 2,
            export_initial_backoff_ms: 10,
            ..Default::default()
        };
        let retry = cfg.retry_config();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.initial_backoff, Duration::from_millis(10));
    }
}
