//! Backend store.
//!
//! One [`Backend`] interface over two physically different engines:
//!
//! - [`kv::KvEngine`]: records at `/<root>/<namespace>/<key>` in a
//!   hierarchical tree, versioned by the node's modified index and persisted
//!   by [`wal::WalKvClient`] when a data directory is configured
//! - [`sql::SqlEngine`]: rows in a `records` table, versioned from a
//!   store-wide sequence and written with conditional updates
//!
//! Both engines hand out opaque bytes; [`records::RecordStore`] layers typed
//! records, encryption and change events on top.

pub mod kv;
pub mod meta;
pub mod records;
pub mod sql;
pub mod tree;
pub mod wal;

pub use kv::{KvClient, KvEngine, KvError, KvNode, MemoryKvClient};
pub use records::{RecordSet, RecordStore, Versioned};
pub use sql::SqlEngine;
pub use wal::WalKvClient;

use crate::core::config::BackendConfig;
use crate::core::error::BulletinResult;
use crate::models::Namespace;
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Storage engine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Kv,
    Relational,
}

impl Engine {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "kv" => Some(Self::Kv),
            "relational" => Some(Self::Relational),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kv => "kv",
            Self::Relational => "relational",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Consistent key-value storage with optimistic concurrency.
///
/// Mutations never silently overwrite: a write against a version that is no
/// longer current fails with `Conflict`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Engine kind.
    fn engine(&self) -> Engine;

    /// Read one record. `NotFound` if absent.
    async fn get(&self, namespace: Namespace, key: &str) -> BulletinResult<StoredRecord>;

    /// Snapshot of every record in a namespace, taken when the call began.
    async fn get_all(&self, namespace: Namespace) -> BulletinResult<Vec<StoredRecord>>;

    /// Insert a new record. `AlreadyExists` if the key is taken.
    async fn create(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> BulletinResult<u64>;

    /// Replace a record if its version is still `expected`.
    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> BulletinResult<u64>;

    /// Remove a record if its version is still `expected`.
    async fn delete(&self, namespace: Namespace, key: &str, expected: u64) -> BulletinResult<()>;

    /// Number of records in a namespace.
    async fn count(&self, namespace: Namespace) -> BulletinResult<usize>;
}

/// Open the engine named by `engine` from configuration.
///
/// The key-value engine logs to `kv.data_dir` when one is set and is
/// memory-only otherwise.
pub fn open_backend(config: &BackendConfig, engine: Engine) -> anyhow::Result<Arc<dyn Backend>> {
    match engine {
        Engine::Kv => {
            let client: Arc<dyn KvClient> = match &config.kv.data_dir {
                Some(dir) => Arc::new(WalKvClient::open_dir(Path::new(dir))?),
                None => {
                    tracing::warn!("kv engine has no data_dir, records will not survive a restart");
                    Arc::new(MemoryKvClient::new())
                }
            };
            Ok(Arc::new(KvEngine::new(client, &config.kv.root)))
        }
        Engine::Relational => {
            let sql = SqlEngine::open(&config.relational).with_context(|| {
                format!(
                    "failed to open relational backend: {}",
                    config.relational.connection_string
                )
            })?;
            Ok(Arc::new(sql))
        }
    }
}
