//! Store bookkeeping in the `meta` namespace.
//!
//! Metadata values are written in plaintext so they can be read before the
//! key set is known to match the data.

use super::records::Versioned;
use super::Backend;
use crate::core::error::{BulletinError, BulletinResult};
use crate::crypto::RecordCodec;
use crate::models::Namespace;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key holding the schema version record.
pub const VERSION_KEY: &str = "version";

/// Key holding the label of the key all records are sealed with.
pub const ENCRYPTION_KEY_LABEL_KEY: &str = "encryption_key_label";

/// Read a metadata value, `None` if it was never written.
pub async fn read_meta<T: DeserializeOwned>(
    backend: &dyn Backend,
    key: &str,
) -> BulletinResult<Option<Versioned<T>>> {
    match backend.get(Namespace::Meta, key).await {
        Ok(stored) => Ok(Some(Versioned {
            record: RecordCodec::decode_plain(&stored.value)?,
            version: stored.version,
        })),
        Err(BulletinError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create or replace a metadata value.
///
/// `expected` is the version last read (`None` if absent); a concurrent
/// writer surfaces as `Conflict` or `AlreadyExists`.
pub async fn write_meta<T: Serialize>(
    backend: &dyn Backend,
    key: &str,
    expected: Option<u64>,
    value: &T,
) -> BulletinResult<u64> {
    let bytes = RecordCodec::encode_plain(value)?;
    match expected {
        Some(version) => {
            backend
                .compare_and_swap(Namespace::Meta, key, version, bytes)
                .await
        }
        None => backend.create(Namespace::Meta, key, bytes).await,
    }
}
