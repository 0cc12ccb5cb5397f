//! Key-value engine.

use super::tree::KvTree;
use super::{Backend, Engine, StoredRecord};
use crate::core::error::{BulletinError, BulletinResult};
use crate::models::Namespace;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// A node returned by a [`KvClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvNode {
    pub path: String,
    pub value: Vec<u8>,
    pub created_index: u64,
    pub modified_index: u64,
}

/// Errors reported by a hierarchical key-value service.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {path}")]
    KeyNotFound { path: String },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("compare failed on {path}: current index {current}")]
    TestFailed { path: String, current: u64 },

    #[error("kv service unavailable: {message}")]
    Unavailable { message: String },
}

/// Client for a hierarchical consistent key-value service with atomic
/// compare-and-swap on the modified index.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<KvNode>, KvError>;

    /// Direct children of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError>;

    async fn create(&self, path: &str, value: Vec<u8>) -> Result<u64, KvError>;

    async fn compare_and_swap(
        &self,
        path: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, KvError>;

    async fn compare_and_delete(&self, path: &str, prev_index: u64) -> Result<(), KvError>;
}

/// [`KvClient`] over an in-process [`KvTree`].
#[derive(Debug, Default)]
pub struct MemoryKvClient {
    tree: RwLock<KvTree>,
}

impl MemoryKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tree-wide index.
    pub fn index(&self) -> u64 {
        self.tree.read().index()
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    async fn get(&self, path: &str) -> Result<Option<KvNode>, KvError> {
        Ok(self.tree.read().get(path))
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError> {
        Ok(self.tree.read().list(dir))
    }

    async fn create(&self, path: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.tree.write().create(path, value)
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, KvError> {
        self.tree.write().compare_and_swap(path, value, prev_index)
    }

    async fn compare_and_delete(&self, path: &str, prev_index: u64) -> Result<(), KvError> {
        self.tree.write().compare_and_delete(path, prev_index)
    }
}

/// [`Backend`] over a [`KvClient`].
pub struct KvEngine {
    client: Arc<dyn KvClient>,
    root: String,
}

impl KvEngine {
    pub fn new(client: Arc<dyn KvClient>, root: &str) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    fn dir(&self, namespace: Namespace) -> String {
        format!("{}/{}", self.root, namespace.as_str())
    }

    fn path(&self, namespace: Namespace, key: &str) -> String {
        format!("{}/{}/{}", self.root, namespace.as_str(), key)
    }

    fn key_of<'a>(&self, namespace: Namespace, path: &'a str) -> &'a str {
        let dir_len = self.root.len() + namespace.as_str().len() + 2;
        path.get(dir_len..).unwrap_or(path)
    }

    fn map_error(namespace: Namespace, key: &str, expected: u64, err: KvError) -> BulletinError {
        match err {
            KvError::KeyNotFound { .. } => BulletinError::not_found(namespace.as_str(), key),
            KvError::NodeExists { .. } => BulletinError::already_exists(namespace.as_str(), key),
            KvError::TestFailed { current, .. } => {
                BulletinError::conflict(namespace.as_str(), key, expected, current)
            }
            KvError::Unavailable { message } => BulletinError::backend(message),
        }
    }
}

#[async_trait]
impl Backend for KvEngine {
    fn engine(&self) -> Engine {
        Engine::Kv
    }

    async fn get(&self, namespace: Namespace, key: &str) -> BulletinResult<StoredRecord> {
        let node = self
            .client
            .get(&self.path(namespace, key))
            .await
            .map_err(|e| Self::map_error(namespace, key, 0, e))?
            .ok_or_else(|| BulletinError::not_found(namespace.as_str(), key))?;
        Ok(StoredRecord {
            key: key.to_string(),
            value: node.value,
            version: node.modified_index,
        })
    }

    async fn get_all(&self, namespace: Namespace) -> BulletinResult<Vec<StoredRecord>> {
        let nodes = self
            .client
            .list(&self.dir(namespace))
            .await
            .map_err(|e| Self::map_error(namespace, "", 0, e))?;
        Ok(nodes
            .into_iter()
            .map(|node| StoredRecord {
                key: self.key_of(namespace, &node.path).to_string(),
                value: node.value,
                version: node.modified_index,
            })
            .collect())
    }

    async fn create(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> BulletinResult<u64> {
        if key.is_empty() || key.contains('/') {
            return Err(BulletinError::invalid(format!(
                "key {:?} is not a single path segment",
                key
            )));
        }
        self.client
            .create(&self.path(namespace, key), value)
            .await
            .map_err(|e| Self::map_error(namespace, key, 0, e))
    }

    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> BulletinResult<u64> {
        self.client
            .compare_and_swap(&self.path(namespace, key), value, expected)
            .await
            .map_err(|e| Self::map_error(namespace, key, expected, e))
    }

    async fn delete(&self, namespace: Namespace, key: &str, expected: u64) -> BulletinResult<()> {
        self.client
            .compare_and_delete(&self.path(namespace, key), expected)
            .await
            .map_err(|e| Self::map_error(namespace, key, expected, e))
    }

    async fn count(&self, namespace: Namespace) -> BulletinResult<usize> {
        let nodes = self
            .client
            .list(&self.dir(namespace))
            .await
            .map_err(|e| Self::map_error(namespace, "", 0, e))?;
        Ok(nodes.len())
    }
}
