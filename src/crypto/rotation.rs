//! Re-encryption of stored records under the primary key.

use super::codec::RecordCodec;
use crate::core::error::{BulletinError, BulletinResult};
use crate::models::Namespace;
use crate::storage::meta::{self, ENCRYPTION_KEY_LABEL_KEY};
use crate::storage::Backend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Marker recording which key all records were last sealed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLabelMarker {
    pub label: String,
}

/// Outcome of a rotation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub scanned: usize,
    pub rewritten: usize,
    pub already_current: usize,
    /// Records changed or removed by a concurrent writer mid-pass.
    pub skipped: usize,
}

/// Rewrites records sealed under retired keys (or stored in plaintext).
pub struct KeyRotator {
    backend: Arc<dyn Backend>,
    codec: RecordCodec,
}

impl KeyRotator {
    pub fn new(backend: Arc<dyn Backend>, codec: RecordCodec) -> Self {
        Self { backend, codec }
    }

    /// Whether the stored marker already names the primary key.
    pub async fn is_current(&self) -> BulletinResult<bool> {
        let marker = meta::read_meta::<KeyLabelMarker>(&*self.backend, ENCRYPTION_KEY_LABEL_KEY).await?;
        Ok(marker.is_some_and(|m| m.record.label == self.codec.cryptor().primary_label()))
    }

    /// Reseal every record not already under the primary key.
    ///
    /// Each rewrite is its own compare-and-swap. A record that moved since
    /// the snapshot was rewritten by its writer under the primary key, so it
    /// is skipped.
    pub async fn rotate(&self) -> BulletinResult<RotationReport> {
        let primary = self.codec.cryptor().primary_label().to_string();
        let mut report = RotationReport::default();

        for namespace in Namespace::RECORDS {
            for stored in self.backend.get_all(namespace).await? {
                report.scanned += 1;
                let Some(value) = self.codec.reseal(&stored.value)? else {
                    report.already_current += 1;
                    continue;
                };
                match self
                    .backend
                    .compare_and_swap(namespace, &stored.key, stored.version, value)
                    .await
                {
                    Ok(_) => report.rewritten += 1,
                    Err(BulletinError::Conflict { .. }) | Err(BulletinError::NotFound { .. }) => {
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let existing = meta::read_meta::<KeyLabelMarker>(&*self.backend, ENCRYPTION_KEY_LABEL_KEY).await?;
        let marker = KeyLabelMarker {
            label: primary.clone(),
        };
        if existing.as_ref().map(|m| &m.record) != Some(&marker) {
            meta::write_meta(
                &*self.backend,
                ENCRYPTION_KEY_LABEL_KEY,
                existing.map(|m| m.version),
                &marker,
            )
            .await?;
        }

        tracing::info!(
            key_label = %primary,
            scanned = report.scanned,
            rewritten = report.rewritten,
            skipped = report.skipped,
            "key rotation complete"
        );
        Ok(report)
    }
}
