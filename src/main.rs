//! Meridian - unified CLI entrypoint.
//!
//! Usage:
//!   meridian start --config config/meridian.toml
//!   meridian config validate --config config/meridian.toml
//!   meridian inspect wal data/meridian.wal

use anyhow::Result;
use clap::Parser;
use meridian::cli::{commands, Cli, Commands, ConfigCommands, InspectCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => commands::run_start(&cli.config).await,
        Commands::Config { command } => match command {
            ConfigCommands::Validate => commands::run_config_validate(&cli.config),
        },
        Commands::Inspect { command } => match command {
            InspectCommands::Wal { path } => commands::run_inspect_wal(&path),
        },
    }
}
