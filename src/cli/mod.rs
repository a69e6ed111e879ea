//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Meridian - distributed eventually-consistent key-value store.
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "config/meridian.toml")]
    pub config: std::path::PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Start,
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect on-disk state.
    Inspect {
        #[command(subcommand)]
        command: InspectCommands,
    },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse and validate the configuration file.
    Validate,
}

/// Inspection subcommands.
#[derive(Subcommand, Debug)]
pub enum InspectCommands {
    /// Walk a write-ahead log and summarize its records.
    Wal {
        /// Path to the log file.
        path: std::path::PathBuf,
    },
}
