//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use bulletin::core::config::{Config, RelationalBackendConfig};
use bulletin::crypto::{Cryptor, KeySet, RecordCodec};
use bulletin::events::EventHub;
use bulletin::lock::Presence;
use bulletin::storage::{Backend, KvEngine, MemoryKvClient, RecordStore, SqlEngine, WalKvClient};
use bulletin::workpool::{CallbackClient, CallbackJob, DeliveryError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// A complete configuration with short intervals, using the kv engine.
pub const TEST_CONFIG: &str = r#"
[lock]
advertise_url = "http://127.0.0.1:8889"
ttl_ms = 300
retry_interval_ms = 20

[encryption]
active_key_label = "new"

[[encryption.keys]]
label = "new"
phrase = "new-phrase"

[[encryption.keys]]
label = "old"
phrase = "old-phrase"

[workers]
callback_workers = 4
retry_backoff_ms = 5
shutdown_grace_ms = 500

[convergence]
interval_ms = 50

[migration]
poll_interval_ms = 10
"#;

/// Parse [`TEST_CONFIG`].
pub fn test_config() -> Config {
    Config::from_toml(TEST_CONFIG).expect("test config must parse")
}

/// Write a configuration file to a temp path.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Key set with an `old` and a `new` key; `active` picks the primary.
pub fn keyset(active: &str) -> KeySet {
    KeySet::new(active, vec![("old", "old-phrase"), ("new", "new-phrase")])
        .expect("valid key set")
}

pub fn codec(active: &str) -> RecordCodec {
    RecordCodec::new(Arc::new(Cryptor::new(keyset(active))))
}

/// Fresh key-value engine over an in-process tree.
pub fn kv_backend() -> Arc<dyn Backend> {
    Arc::new(KvEngine::new(Arc::new(MemoryKvClient::new()), "/v1"))
}

/// Kv engine persisted to a write-ahead log in `dir`.
pub fn wal_backend_in(dir: &std::path::Path) -> Arc<dyn Backend> {
    let client = WalKvClient::open_dir(dir).expect("open kv log");
    Arc::new(KvEngine::new(Arc::new(client), "/v1"))
}

/// Fresh log-backed kv engine in a temp directory.
///
/// Keep the `TempDir` alive for as long as the engine is used.
pub fn wal_backend() -> (Arc<dyn Backend>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    (wal_backend_in(dir.path()), dir)
}

/// Fresh sqlite-backed relational engine in a temp directory.
///
/// Keep the `TempDir` alive for as long as the engine is used.
pub fn sql_backend() -> (Arc<dyn Backend>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("bulletin.db");
    let config = RelationalBackendConfig {
        driver: "sqlite".to_string(),
        connection_string: path.to_string_lossy().into_owned(),
        max_connections: 4,
    };
    let engine = SqlEngine::open(&config).expect("open sqlite");
    (Arc::new(engine), dir)
}

/// Record store sealing with the `new` key and publishing on `hub`.
pub fn store_with_events(backend: Arc<dyn Backend>, hub: Arc<EventHub>) -> RecordStore {
    RecordStore::new(backend, codec("new")).with_events(hub)
}

pub fn store(backend: Arc<dyn Backend>) -> RecordStore {
    RecordStore::new(backend, codec("new"))
}

pub fn presence(id: &str) -> Presence {
    Presence::new(id, format!("http://{}.local:8889", id))
}

/// Callback client replaying scripted outcomes.
///
/// Each call pops the next outcome; once the script is empty every call
/// succeeds. All jobs are recorded in call order.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    calls: Mutex<Vec<CallbackJob>>,
    delay: Option<Duration>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            ..Self::default()
        }
    }

    /// Every delivery takes `delay` before completing.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<CallbackJob> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CallbackClient for ScriptedClient {
    async fn deliver(&self, job: &CallbackJob) -> Result<(), DeliveryError> {
        self.calls.lock().push(job.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.script.lock().pop_front();
        outcome.unwrap_or(Ok(()))
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses() {
        let config = test_config();
        assert_eq!(config.encryption.active_key_label, "new");
        assert_eq!(config.backend.engine, "kv");
    }

    #[test]
    fn test_keyset_primary() {
        assert_eq!(keyset("old").primary().label(), "old");
    }
}
