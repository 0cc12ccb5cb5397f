//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the Bulletin server.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Active engine (kv, relational), overriding the config file.
    #[arg(long)]
    pub engine: Option<String>,

    /// Relational connection string, overriding the config file.
    #[arg(long)]
    pub connection_string: Option<String>,

    /// URL advertised while holding the lock.
    #[arg(long)]
    pub advertise_url: Option<String>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

/// Run the start command with the given config path.
pub async fn run_start_with_config(
    config_path: &Path,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        engine: args.engine,
        connection_string: args.connection_string,
        advertise_url: args.advertise_url,
    });

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
