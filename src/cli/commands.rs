//! CLI command implementations.

use crate::core::config::Config;
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use std::path::Path;

/// Initialize the tracing subscriber. RUST_LOG overrides the configured
/// default filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// `meridian start`: load the configuration and serve until interrupted.
pub async fn run_start(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    init_tracing(&config.telemetry.log_level);

    let runtime = Runtime::new(config)?;
    runtime.run().await
}

/// `meridian config validate`: parse and validate, printing the outcome.
pub fn run_config_validate(config_path: &Path) -> Result<()> {
    match Config::from_file(config_path) {
        Ok(config) => {
            println!(
                "{}: ok (node {}, {} peers)",
                config_path.display(),
                config.node.id,
                config.mesh.peers.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: invalid", config_path.display());
            Err(e)
        }
    }
}

/// `meridian inspect wal`: walk a log file and summarize its records.
pub fn run_inspect_wal(path: &Path) -> Result<()> {
    use crate::storage::wal::{WalOp, WriteAheadLog};

    anyhow::ensure!(path.is_file(), "no log file at {}", path.display());
    let wal = WriteAheadLog::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut puts = 0u64;
    let mut deletes = 0u64;
    let mut patches = 0u64;
    let mut payload_bytes = 0u64;
    let replayed = wal.recover(|op, _key, payload| {
        match op {
            WalOp::Put => puts += 1,
            WalOp::Delete => deletes += 1,
            WalOp::PatchI64 | WalOp::PatchStr => patches += 1,
            WalOp::Batch => {}
        }
        payload_bytes += payload.len() as u64;
        Ok(())
    })?;

    let file_len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    println!("{}", path.display());
    println!("  file bytes:      {}", file_len);
    println!("  replayable ops:  {}", replayed);
    println!("    puts:          {}", puts);
    println!("    deletes:       {}", deletes);
    println!("    patches:       {}", patches);
    println!("  payload bytes:   {}", payload_bytes);
    Ok(())
}
