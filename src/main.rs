//! Bulletin - unified CLI entrypoint.
//!
//! Usage:
//!   bulletin start --config config/bulletin.toml
//!   bulletin config validate --config config/bulletin.toml
//!   bulletin config show --config config/bulletin.toml --format json
//!   bulletin config generate --engine relational

use anyhow::Result;
use bulletin::cli::commands::{run_config, run_start_with_config};
use bulletin::cli::{Cli, Commands};
use clap::Parser;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/bulletin.toml"));

    match cli.command {
        Commands::Start(args) => run_start_with_config(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(args, &config_path),
    }
}
