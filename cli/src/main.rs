//! EtherQuery operator CLI.
//!
//! # Commands
//! ```text
//! etherquery info
//! etherquery config --file <etherquery.yaml>
//! etherquery cursor show  --store <path> [--project <p>] [--dataset <d>]
//! etherquery cursor set   --store <path> --block <n> --hash <0x...>
//! etherquery cursor reset --store <path>
//! ```
//!
//! `--store` is a JSON cursor file, or `sqlite:<path>` when built with the
//! `sqlite` feature.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use etherquery_core::ServiceConfig;
use etherquery_observability::{init_tracing, LogConfig};

mod cmd_cursor;

#[derive(Parser)]
#[command(
    name = "etherquery",
    about = "Export Ethereum blocks, transactions and logs to BigQuery",
    long_about = "
EtherQuery operator CLI: validate service configuration files and inspect or
repair the persisted export cursor. The export service itself runs inside the
host node.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides --log-level (tracing EnvFilter syntax)
",
    version
)]
struct Cli {
    /// Global log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show build info and configuration defaults
    Info,

    /// Load, validate and print a YAML service configuration
    Config {
        /// Path to the YAML file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Inspect or repair the persisted export cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum CursorAction {
    /// Print the cursor
    Show {
        #[command(flatten)]
        target: cmd_cursor::CursorTarget,
    },
    /// Overwrite the cursor
    Set {
        #[command(flatten)]
        target: cmd_cursor::CursorTarget,
        /// Last exported block number
        #[arg(long)]
        block: u64,
        /// Hash of that block (0x-prefixed)
        #[arg(long)]
        hash: String,
    },
    /// Delete the cursor; the service restarts from `start_block`
    Reset {
        #[command(flatten)]
        target: cmd_cursor::CursorTarget,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
        ..LogConfig::default()
    })
    .context("failed to install tracing subscriber")?;

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Config { file } => cmd_config(&file),
        Commands::Cursor { action } => cmd_cursor::run(action).await,
    }
}

fn cmd_info() -> Result<()> {
    let defaults = ServiceConfig::default();
    println!("EtherQuery v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default project/dataset: {}/{}", defaults.project, defaults.dataset);
    println!("  Default batch interval: {} ms", defaults.batch_interval_ms);
    println!("  Default batch size: {} records", defaults.batch_size);
    println!("  Default max reorg depth: {} blocks", defaults.max_reorg_depth);
    println!(
        "  Default export retries: {} (backoff {}..{} ms)",
        defaults.export_max_retries,
        defaults.export_initial_backoff_ms,
        defaults.export_max_backoff_ms
    );
    println!("  Tables: blocks, transactions, logs");
    if cfg!(feature = "sqlite") {
        println!("  Cursor stores: memory, JSON file, SQLite");
    } else {
        println!("  Cursor stores: memory, JSON file (SQLite: feature `sqlite`)");
    }
    Ok(())
}

fn cmd_config(file: &Path) -> Result<()> {
    let config = load_config(file)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("✓ valid (cursor key: {})", config.cursor_key());
    Ok(())
}

/// Read a YAML `ServiceConfig`; missing keys take their defaults.
fn load_config(path: &Path) -> Result<ServiceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_config(yaml: &str) -> Result<ServiceConfig> {
    let config: ServiceConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
