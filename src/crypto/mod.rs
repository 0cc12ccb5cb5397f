//! Envelope encryption.
//!
//! - [`keys`] - Key derivation and the immutable key set
//! - [`cryptor`] - AES-256-GCM sealing under the primary key
//! - [`codec`] - Tagged stored-value format
//! - [`rotation`] - Resealing records under a new primary key

pub mod codec;
pub mod cryptor;
pub mod keys;
pub mod rotation;

pub use codec::{Format, Inspected, Payload, RecordCodec, CURRENT_SCHEMA};
pub use cryptor::{Cryptor, Envelope};
pub use keys::{Key, KeySet};
pub use rotation::{KeyRotator, RotationReport};
