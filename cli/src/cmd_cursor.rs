//! `etherquery cursor show|set|reset`

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::B256;
use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use tracing::info;

use etherquery_core::checkpoint::{Checkpoint, CursorStore};
use etherquery_core::{Cursor, ServiceConfig};
use etherquery_storage::FileCursorStore;

use crate::CursorAction;

/// Which store and which cursor key to operate on.
#[derive(Args, Debug)]
pub(crate) struct CursorTarget {
    /// JSON cursor file, or `sqlite:<path>`
    #[arg(long)]
    pub store: String,
    /// Warehouse project (first half of the cursor key)
    #[arg(long, default_value = "etherquery")]
    pub project: String,
    /// Warehouse dataset (second half of the cursor key)
    #[arg(long, default_value = "ethereum")]
    pub dataset: String,
}

impl CursorTarget {
    fn key(&self) -> String {
        ServiceConfig {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            ..ServiceConfig::default()
        }
        .cursor_key()
    }
}

pub(crate) async fn run(action: CursorAction) -> Result<()> {
    match action {
        CursorAction::Show { target } => {
            let store = open_store(&target.store).await?;
            let key = target.key();
            match store.load(&key).await? {
                Some(cp) => {
                    cp.validate()?;
                    println!("{}", serde_json::to_string_pretty(&cp)?);
                }
                None => println!("no cursor stored under '{key}'"),
            }
        }
        CursorAction::Set {
            target,
            block,
            hash,
        } => {
            let store = open_store(&target.store).await?;
            let cursor = Cursor::new(block, parse_hash(&hash)?);
            let checkpoint = Checkpoint::new(target.key(), cursor);
            store.save(checkpoint.clone()).await?;
            info!(key = %checkpoint.key, block, "cursor overwritten");
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CursorAction::Reset { target } => {
            let store = open_store(&target.store).await?;
            let key = target.key();
            store.delete(&key).await?;
            info!(key = %key, "cursor deleted");
            println!("cursor '{key}' deleted; the service will restart from start_block");
        }
    }
    Ok(())
}

async fn open_store(location: &str) -> Result<Arc<dyn CursorStore>> {
    match StoreLocation::parse(location)? {
        StoreLocation::File(path) => Ok(Arc::new(FileCursorStore::new(path))),
        #[cfg(feature = "sqlite")]
        StoreLocation::Sqlite(path) => {
            let store = etherquery_storage::SqliteCursorStore::open(&path)
                .await
                .with_context(|| format!("cannot open SQLite store {path}"))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreLocation::Sqlite(_) => bail!("SQLite cursor stores need the `sqlite` feature"),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StoreLocation {
    File(String),
    Sqlite(String),
}

impl StoreLocation {
    fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if let Some(path) = location.strip_prefix("sqlite:") {
            if path.is_empty() {
                bail!("empty SQLite path in '{location}'");
            }
            return Ok(Self::Sqlite(path.to_string()));
        }
        if location.is_empty() {
            bail!("--store must not be empty");
        }
        Ok(Self::File(location.to_string()))
    }
}

fn parse_hash(s: &str) -> Result<B256> {
    let hex = s.trim();
    if !hex.starts_with("0x") || hex.len() != 66 {
        return Err(anyhow!("block hash must be 0x followed by 64 hex digits, got '{s}'"));
    }
    B256::from_str(hex).with_context(|| format!("invalid block hash '{s}'"))
}
