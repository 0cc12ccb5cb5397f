//! Migrations shipped with the binary.

use super::{Migration, MigrationContext};
use crate::core::error::{BulletinError, BulletinResult};
use crate::crypto::{Format, RecordCodec};
use crate::models::Namespace;
use crate::storage::Backend;
use async_trait::async_trait;
use std::sync::Arc;

/// Attempts per record before a copy is considered failed.
const COPY_ATTEMPTS: usize = 3;

/// The registry every process runs.
pub fn builtin_migrations() -> Vec<Arc<dyn Migration>> {
    vec![Arc::new(EncryptPlaintextRecords), Arc::new(CopyLegacyEngine)]
}

/// Seal records written before encryption was enabled.
pub struct EncryptPlaintextRecords;

#[async_trait]
impl Migration for EncryptPlaintextRecords {
    fn version(&self) -> u64 {
        1
    }

    fn name(&self) -> &str {
        "encrypt-plaintext-records"
    }

    async fn up(&self, ctx: &MigrationContext) -> BulletinResult<()> {
        let mut sealed = 0usize;
        for namespace in Namespace::RECORDS {
            for stored in ctx.backend.get_all(namespace).await? {
                let inspected = RecordCodec::inspect(&stored.value)?;
                if inspected.format() != Format::Plain {
                    continue;
                }
                let value = ctx.codec.seal(&ctx.codec.open(&stored.value)?)?;
                match ctx
                    .backend
                    .compare_and_swap(namespace, &stored.key, stored.version, value)
                    .await
                {
                    Ok(_) => sealed += 1,
                    // Rewritten or removed since the snapshot; the writer sealed it.
                    Err(BulletinError::Conflict { .. }) | Err(BulletinError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::info!(sealed, "plaintext records encrypted");
        Ok(())
    }
}

/// Copy every record from the legacy engine into the active one.
///
/// Existing records in the active engine are overwritten, so a rerun after
/// a crash converges on the same result.
pub struct CopyLegacyEngine;

impl CopyLegacyEngine {
    async fn copy_one(
        target: &dyn Backend,
        namespace: Namespace,
        key: &str,
        value: Vec<u8>,
    ) -> BulletinResult<()> {
        let mut last_err = None;
        for _ in 0..COPY_ATTEMPTS {
            let result = match target.get(namespace, key).await {
                Ok(existing) if existing.value == value => return Ok(()),
                Ok(existing) => target
                    .compare_and_swap(namespace, key, existing.version, value.clone())
                    .await
                    .map(|_| ()),
                Err(BulletinError::NotFound { .. }) => {
                    target.create(namespace, key, value.clone()).await.map(|_| ())
                }
                Err(e) => return Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(
                    e @ (BulletinError::Conflict { .. }
                    | BulletinError::AlreadyExists { .. }
                    | BulletinError::NotFound { .. }),
                ) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| BulletinError::backend(format!("copy of {namespace}/{key} failed"))))
    }
}

#[async_trait]
impl Migration for CopyLegacyEngine {
    fn version(&self) -> u64 {
        2
    }

    fn name(&self) -> &str {
        "copy-legacy-engine"
    }

    async fn up(&self, ctx: &MigrationContext) -> BulletinResult<()> {
        let Some(legacy) = &ctx.legacy else {
            tracing::debug!("no legacy engine configured, nothing to copy");
            return Ok(());
        };

        let mut copied = 0usize;
        for namespace in Namespace::RECORDS {
            for stored in legacy.get_all(namespace).await? {
                let value = match ctx.codec.reseal(&stored.value)? {
                    Some(resealed) => resealed,
                    None => stored.value,
                };
                Self::copy_one(&*ctx.backend, namespace, &stored.key, value).await?;
                copied += 1;
            }
        }
        tracing::info!(
            copied,
            from = %legacy.engine(),
            to = %ctx.backend.engine(),
            "legacy records copied"
        );
        Ok(())
    }
}
