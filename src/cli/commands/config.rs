//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate,
    /// Print configuration with defaults filled in. Passphrases are redacted.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Active engine (kv, relational).
        #[arg(long, default_value = "kv")]
        engine: String,
    },
}

/// Run the config command against the file named by the global `--config`.
pub fn run_config(args: ConfigArgs, config: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config),
        ConfigCommand::Show { format } => show_config(config, &format),
        ConfigCommand::Generate { output, engine } => generate_config(output.as_deref(), &engine),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Config file is valid");
    println!("  engine: {}", config.backend.engine);
    if let Some(legacy) = &config.backend.legacy_engine {
        println!("  legacy engine: {} (records will be copied on startup)", legacy);
    }
    println!(
        "  encryption: {} key(s), active '{}'",
        config.encryption.keys.len(),
        config.encryption.active_key_label
    );
    println!(
        "  lock: {} (ttl {}ms, {} coordinator)",
        config.lock.lock_key, config.lock.ttl_ms, config.lock.coordinator
    );
    if config.backend.engine == "relational"
        && config.backend.relational.connection_string == ":memory:"
    {
        println!("  ⚠ Warning: relational engine is in-memory; records are lost on restart");
    }
    if config.backend.engine == "kv" && config.backend.kv.data_dir.is_none() {
        println!("  ⚠ Warning: kv engine has no data_dir; records are lost on restart");
    }
    if config.lock.coordinator == "memory" {
        println!("  ⚠ Warning: memory coordinator only excludes writers within this process");
    }
    println!("✓ Configuration validation complete");
    Ok(())
}

fn redacted(mut config: Config) -> Config {
    for key in &mut config.encryption.keys {
        key.phrase = "<redacted>".to_string();
    }
    config
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = redacted(Config::from_file(path)?);

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config).context("failed to render config")?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn generate_config(output: Option<&Path>, engine: &str) -> Result<()> {
    let template = template(engine);

    match output {
        Some(path) => {
            std::fs::write(path, &template)
                .with_context(|| format!("failed to write {:?}", path))?;
            println!("Generated {} config template: {:?}", engine, path);
        }
        None => {
            println!("{}", template);
        }
    }

    Ok(())
}

fn template(engine: &str) -> String {
    let backend = match engine {
        "relational" => {
            r#"[backend]
engine = "relational"

[backend.relational]
driver = "sqlite"
connection_string = "data/bulletin.db"
max_connections = 8"#
        }
        _ => {
            r#"[backend]
engine = "kv"

[backend.kv]
root = "/v1"
data_dir = "data/kv""#
        }
    };

    format!(
        r#"# Bulletin Configuration

[lock]
advertise_url = "http://127.0.0.1:8889"
lock_key = "v1/locks/bulletin_lock"
ttl_ms = 15000
retry_interval_ms = 5000
coordinator = "backend"

[encryption]
active_key_label = "key-1"

[[encryption.keys]]
label = "key-1"
phrase = "change-me"

{backend}

[workers]
callback_workers = 1000
submission_policy = "block"
max_attempts = 3
retry_backoff_ms = 500
shutdown_grace_ms = 5000
request_timeout_ms = 10000

[convergence]
interval_ms = 30000
kick_task_duration_ms = 30000

[hub]
subscriber_buffer = 100

[migration]
poll_interval_ms = 1000

[telemetry]
log_level = "info"
"#
    )
}
