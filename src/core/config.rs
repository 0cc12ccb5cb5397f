//! Configuration parsing and validation.
//!
//! Bulletin configuration is loaded from TOML files with CLI overrides.
//! Sections mirror the components they configure.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level Bulletin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Leader lock configuration.
    pub lock: LockConfig,

    /// Encryption key set.
    pub encryption: EncryptionConfig,

    /// Storage engine selection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Callback work pool sizing and retry policy.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Convergence timer.
    #[serde(default)]
    pub convergence: ConvergenceConfig,

    /// Event hub buffering.
    #[serde(default)]
    pub hub: HubConfig,

    /// Migration manager polling.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Leader lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// URL advertised as the lock holder's presence.
    pub advertise_url: String,

    /// Cluster-wide lock key.
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// Lock TTL in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// Interval between failed acquisition attempts in milliseconds.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Where the lock lives: "backend" (shared store) or "memory" (this process only).
    #[serde(default = "default_lock_coordinator")]
    pub coordinator: String,
}

/// Encryption key set configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Label of the key used for new writes.
    pub active_key_label: String,

    /// All keys, active and retired.
    #[serde(default)]
    pub keys: Vec<EncryptionKeyConfig>,
}

/// A single encryption key.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionKeyConfig {
    /// Key identifier stored in envelopes.
    pub label: String,

    /// Passphrase the key is derived from.
    pub phrase: String,
}

impl std::fmt::Debug for EncryptionKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyConfig")
            .field("label", &self.label)
            .field("phrase", &"<redacted>")
            .finish()
    }
}

/// Storage engine selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Active engine: "kv" or "relational".
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Engine to copy records from during migration ("kv" or "relational").
    #[serde(default)]
    pub legacy_engine: Option<String>,

    /// Key-value engine settings.
    #[serde(default)]
    pub kv: KvBackendConfig,

    /// Relational engine settings.
    #[serde(default)]
    pub relational: RelationalBackendConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            legacy_engine: None,
            kv: KvBackendConfig::default(),
            relational: RelationalBackendConfig::default(),
        }
    }
}

/// Key-value engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvBackendConfig {
    /// Root path under which namespaces live.
    #[serde(default = "default_kv_root")]
    pub root: String,

    /// Directory holding the tree's write-ahead log. Without one the tree
    /// lives in memory only.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for KvBackendConfig {
    fn default() -> Self {
        Self {
            root: default_kv_root(),
            data_dir: None,
        }
    }
}

/// Relational engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalBackendConfig {
    /// Driver name. Only "sqlite" is compiled in.
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Driver connection string (a file path or ":memory:" for sqlite).
    #[serde(default = "default_connection_string")]
    pub connection_string: String,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RelationalBackendConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            connection_string: default_connection_string(),
            max_connections: default_max_connections(),
        }
    }
}

/// Callback work pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of callback workers (also the queue capacity).
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,

    /// Submission policy when the queue is full: "block" or "reject".
    #[serde(default = "default_submission_policy")]
    pub submission_policy: String,

    /// Delivery attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry backoff in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Grace period to drain in-flight jobs on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Per-request timeout for callback delivery.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            callback_workers: default_callback_workers(),
            submission_policy: default_submission_policy(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Convergence timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Scan interval in milliseconds.
    #[serde(default = "default_convergence_interval_ms")]
    pub interval_ms: u64,

    /// How long a task may stay resolving before its callback is retried.
    #[serde(default = "default_kick_task_duration_ms")]
    pub kick_task_duration_ms: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_convergence_interval_ms(),
            kick_task_duration_ms: default_kick_task_duration_ms(),
        }
    }
}

/// Event hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber buffered events before disconnection.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Migration manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// How often a non-holder polls the stored schema version.
    #[serde(default = "default_migration_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_migration_poll_interval_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_lock_key() -> String {
    "v1/locks/bulletin_lock".to_string()
}

fn default_lock_ttl_ms() -> u64 {
    15_000
}

fn default_lock_retry_interval_ms() -> u64 {
    5_000
}

fn default_lock_coordinator() -> String {
    "backend".to_string()
}

fn default_engine() -> String {
    "kv".to_string()
}

fn default_kv_root() -> String {
    "/v1".to_string()
}

fn default_driver() -> String {
    "sqlite".to_string()
}

fn default_connection_string() -> String {
    ":memory:".to_string()
}

fn default_max_connections() -> usize {
    8
}

fn default_callback_workers() -> usize {
    1000
}

fn default_submission_policy() -> String {
    "block".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_convergence_interval_ms() -> u64 {
    30_000
}

fn default_kick_task_duration_ms() -> u64 {
    30_000
}

fn default_subscriber_buffer() -> usize {
    100
}

fn default_migration_poll_interval_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

const ENGINES: [&str; 2] = ["kv", "relational"];

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref engine) = overrides.engine {
            self.backend.engine = engine.clone();
        }
        if let Some(ref connection_string) = overrides.connection_string {
            self.backend.relational.connection_string = connection_string.clone();
        }
        if let Some(ref advertise_url) = overrides.advertise_url {
            self.lock.advertise_url = advertise_url.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_lock()?;
        self.validate_encryption()?;
        self.validate_backend()?;
        self.validate_workers()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_lock(&self) -> Result<()> {
        if self.lock.advertise_url.is_empty() {
            anyhow::bail!("lock.advertise_url must be specified");
        }
        if self.lock.lock_key.is_empty() {
            anyhow::bail!("lock.lock_key must not be empty");
        }
        // Renewal runs at ttl/3, which must be a usable interval.
        if self.lock.ttl_ms < 3 {
            anyhow::bail!("lock.ttl_ms must be >= 3, got: {}", self.lock.ttl_ms);
        }
        if self.lock.retry_interval_ms == 0 {
            anyhow::bail!("lock.retry_interval_ms must be > 0");
        }
        if self.lock.coordinator != "backend" && self.lock.coordinator != "memory" {
            anyhow::bail!(
                "lock.coordinator must be 'backend' or 'memory', got: {}",
                self.lock.coordinator
            );
        }
        Ok(())
    }

    fn validate_encryption(&self) -> Result<()> {
        if self.encryption.keys.is_empty() {
            anyhow::bail!("encryption.keys must contain at least one key");
        }
        if !self
            .encryption
            .keys
            .iter()
            .any(|k| k.label == self.encryption.active_key_label)
        {
            anyhow::bail!(
                "encryption.active_key_label '{}' does not match any configured key",
                self.encryption.active_key_label
            );
        }
        Ok(())
    }

    fn validate_backend(&self) -> Result<()> {
        if !ENGINES.contains(&self.backend.engine.as_str()) {
            anyhow::bail!(
                "backend.engine must be 'kv' or 'relational', got: {}",
                self.backend.engine
            );
        }

        if let Some(ref legacy) = self.backend.legacy_engine {
            if !ENGINES.contains(&legacy.as_str()) {
                anyhow::bail!(
                    "backend.legacy_engine must be 'kv' or 'relational', got: {}",
                    legacy
                );
            }
            if *legacy == self.backend.engine {
                anyhow::bail!("backend.legacy_engine must differ from backend.engine");
            }
            // An in-memory tree has nothing to copy from.
            if legacy == "kv" && self.backend.kv.data_dir.is_none() {
                anyhow::bail!("backend.legacy_engine 'kv' requires backend.kv.data_dir");
            }
        }

        let uses_relational = self.backend.engine == "relational"
            || self.backend.legacy_engine.as_deref() == Some("relational");
        if uses_relational {
            if self.backend.relational.driver != "sqlite" {
                anyhow::bail!(
                    "backend.relational.driver '{}' is not supported (available: sqlite)",
                    self.backend.relational.driver
                );
            }
            if self.backend.relational.connection_string.is_empty() {
                anyhow::bail!("backend.relational.connection_string must not be empty");
            }
            if self.backend.relational.max_connections == 0 {
                anyhow::bail!("backend.relational.max_connections must be > 0");
            }
        }

        if !self.backend.kv.root.starts_with('/') {
            anyhow::bail!("backend.kv.root must start with '/', got: {}", self.backend.kv.root);
        }
        if self.backend.kv.data_dir.as_deref() == Some("") {
            anyhow::bail!("backend.kv.data_dir must not be empty");
        }
        Ok(())
    }

    fn validate_workers(&self) -> Result<()> {
        if self.workers.callback_workers == 0 {
            anyhow::bail!("workers.callback_workers must be > 0");
        }
        if self.workers.submission_policy != "block" && self.workers.submission_policy != "reject"
        {
            anyhow::bail!(
                "workers.submission_policy must be 'block' or 'reject', got: {}",
                self.workers.submission_policy
            );
        }
        if self.workers.max_attempts == 0 {
            anyhow::bail!("workers.max_attempts must be > 0");
        }
        if self.convergence.interval_ms == 0 {
            anyhow::bail!("convergence.interval_ms must be > 0");
        }
        if self.convergence.kick_task_duration_ms == 0 {
            anyhow::bail!("convergence.kick_task_duration_ms must be > 0");
        }
        if self.hub.subscriber_buffer == 0 {
            anyhow::bail!("hub.subscriber_buffer must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override active engine.
    pub engine: Option<String>,
    /// Override relational connection string.
    pub connection_string: Option<String>,
    /// Override advertised URL.
    pub advertise_url: Option<String>,
}
