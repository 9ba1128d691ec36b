//! BigQuery `tabledata.insertAll` client backed by `reqwest`.
//!
//! One `write` call sends one request per table present in the batch
//! (`blocks`, then `transactions`, then `logs`). Retrying is left to the
//! `WarehouseExporter`; this client only classifies failures:
//! - 429 → `RateLimited` (honours `Retry-After`)
//! - 5xx, connection errors → `Http` (retryable)
//! - client timeouts → `Timeout` (retryable)
//! - other 4xx → `Rejected` (permanent)
//! - row-level `insertErrors` → `Partial`, indexes mapped back to the batch

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use etherquery_core::exporter::{SinkError, WarehouseSink};
use etherquery_core::indexer::ServiceConfig;
use etherquery_core::records::{Record, RecordKind};

use crate::rows;

/// Default BigQuery REST endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Row error reasons BigQuery reports for rows that may succeed when resent.
const RETRYABLE_REASONS: &[&str] = &["stopped", "backendError", "internalError", "timeout"];

/// Errors building a `BigQuerySink`.
#[derive(Debug, Error)]
pub enum BigQueryError {
    #[error("invalid BigQuery configuration: {0}")]
    Config(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Configuration for `BigQuerySink`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BigQueryConfig {
    /// GCP project ID.
    pub project: String,
    /// Dataset holding the `blocks`, `transactions` and `logs` tables.
    pub dataset: String,
    /// REST endpoint, overridable for emulators.
    pub endpoint: String,
    /// OAuth2 bearer token. Requests are sent unauthenticated when unset.
    pub access_token: Option<String>,
    pub request_timeout_ms: u64,
    /// Ask BigQuery to insert the valid rows of a request that has invalid ones.
    pub skip_invalid_rows: bool,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project: "etherquery".into(),
            dataset: "ethereum".into(),
            endpoint: DEFAULT_ENDPOINT.into(),
            access_token: None,
            request_timeout_ms: 30_000,
            skip_invalid_rows: false,
        }
    }
}

impl BigQueryConfig {
    /// Target the project and dataset of a service configuration.
    pub fn for_service(service: &ServiceConfig) -> Self {
        Self {
            project: service.project.clone(),
            dataset: service.dataset.clone(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `insertAll` URL for `table`.
    pub fn insert_url(&self, table: &str) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint.trim_end_matches('/'),
            self.project,
            self.dataset,
            table
        )
    }
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: &'a [InsertRow],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRow {
    insert_id: String,
    json: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowErrors>,
}

#[derive(Debug, Deserialize)]
struct RowErrors {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Failed rows of one request, as indexes into the request's rows.
#[derive(Debug, Default, PartialEq, Eq)]
struct RowFailures {
    indexes: Vec<usize>,
    retryable: bool,
    reason: String,
}

impl InsertAllResponse {
    fn failures(&self) -> Option<RowFailures> {
        if self.insert_errors.is_empty() {
            return None;
        }
        let mut failures = RowFailures {
            retryable: true,
            ..RowFailures::default()
        };
        for row in &self.insert_errors {
            failures.indexes.push(row.index);
            for err in &row.errors {
                if !RETRYABLE_REASONS.contains(&err.reason.as_str()) {
                    failures.retryable = false;
                    if failures.reason.is_empty() {
                        failures.reason = format!("{}: {}", err.reason, err.message);
                    }
                }
            }
        }
        if failures.reason.is_empty() {
            failures.reason = format!("{} rows not inserted", failures.indexes.len());
        }
        Some(failures)
    }
}

/// Map a non-success HTTP status to a sink error.
fn status_error(status: u16, body: &str, retry_after: Option<Duration>) -> SinkError {
    match status {
        429 => SinkError::RateLimited { retry_after },
        500..=599 => SinkError::Http(format!("HTTP {status}: {body}")),
        _ => SinkError::Rejected(format!("HTTP {status}: {body}")),
    }
}

// ─── Sink ─────────────────────────────────────────────────────────────────────

/// Warehouse sink writing to BigQuery tables.
pub struct BigQuerySink {
    config: BigQueryConfig,
    http: reqwest::Client,
}

impl BigQuerySink {
    pub fn new(config: BigQueryConfig) -> Result<Self, BigQueryError> {
        if config.project.is_empty() || config.dataset.is_empty() {
            return Err(BigQueryError::Config(
                "project and dataset must be set".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    async fn insert_all(
        &self,
        table: &str,
        rows: &[InsertRow],
    ) -> Result<Option<RowFailures>, SinkError> {
        let body = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: self.config.skip_invalid_rows,
            ignore_unknown_values: false,
            rows,
        };

        let mut request = self.http.post(self.config.insert_url(table)).json(&body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout {
                    ms: self.config.request_timeout_ms,
                }
            } else {
                SinkError::Http(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body, retry_after));
        }

        let parsed = resp
            .json::<InsertAllResponse>()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        Ok(parsed.failures())
    }
}

#[async_trait]
impl WarehouseSink for BigQuerySink {
    fn name(&self) -> &str {
        "bigquery"
    }

    async fn write(&self, records: &[Record]) -> Result<(), SinkError> {
        let mut failed: Vec<usize> = Vec::new();
        let mut retryable = true;
        let mut reason = String::new();
        let mut written_any = false;

        for kind in [RecordKind::Block, RecordKind::Transaction, RecordKind::Log] {
            let indexes: Vec<usize> = records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.kind() == kind)
                .map(|(i, _)| i)
                .collect();
            if indexes.is_empty() {
                continue;
            }
            let rows: Vec<InsertRow> = indexes
                .iter()
                .map(|&i| InsertRow {
                    insert_id: records[i].key().to_string(),
                    json: rows::encode(&records[i]),
                })
                .collect();

            match self.insert_all(kind.table(), &rows).await {
                Ok(None) => {
                    written_any = true;
                    tracing::debug!(table = kind.table(), rows = rows.len(), "rows inserted");
                }
                Ok(Some(failures)) => {
                    written_any = true;
                    tracing::warn!(
                        table = kind.table(),
                        failed = failures.indexes.len(),
                        reason = %failures.reason,
                        "rows rejected"
                    );
                    failed.extend(failures.indexes.iter().filter_map(|&i| indexes.get(i).copied()));
                    retryable &= failures.retryable;
                    if reason.is_empty() {
                        reason = failures.reason;
                    }
                }
                Err(e) if !written_any && failed.is_empty() => return Err(e),
                Err(e) => {
                    // Earlier tables are in; hand back this table and the rest.
                    failed.extend(
                        records
                            .iter()
                            .enumerate()
                            .filter(|(_, r)| r.kind() >= kind)
                            .map(|(i, _)| i),
                    );
                    retryable &= e.is_retryable();
                    reason = e.to_string();
                    break;
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        failed.sort_unstable();
        failed.dedup();
        Err(SinkError::Partial {
            failed,
            retryable,
            reason,
        })
    }
}
