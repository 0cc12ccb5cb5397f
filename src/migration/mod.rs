//! Versioned, blocking migration pipeline.
//!
//! The lock holder reads the stored schema version, applies every
//! registered migration with a greater version in ascending order, and bumps
//! the stored version after each one. Other processes poll the stored version
//! until it reaches the target. Traffic is gated on [`Readiness`].

pub mod builtin;
pub mod manager;

pub use builtin::{builtin_migrations, CopyLegacyEngine, EncryptPlaintextRecords};
pub use manager::{MigrationManager, MigrationState, Readiness, VersionRecord};

use crate::core::error::BulletinResult;
use crate::crypto::RecordCodec;
use crate::storage::Backend;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a migration may touch.
#[derive(Clone)]
pub struct MigrationContext {
    /// Active engine.
    pub backend: Arc<dyn Backend>,
    /// Engine being retired, when one is configured.
    pub legacy: Option<Arc<dyn Backend>>,
    pub codec: RecordCodec,
}

impl MigrationContext {
    pub fn new(backend: Arc<dyn Backend>, codec: RecordCodec) -> Self {
        Self {
            backend,
            legacy: None,
            codec,
        }
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn Backend>) -> Self {
        self.legacy = Some(legacy);
        self
    }
}

/// A single schema or format change.
///
/// `up` must be safe to run again after a crash part-way through.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Version the store is at once this migration has run.
    fn version(&self) -> u64;

    fn name(&self) -> &str;

    async fn up(&self, ctx: &MigrationContext) -> BulletinResult<()>;
}
