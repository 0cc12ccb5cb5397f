//! Encryption key set.

use crate::core::config::EncryptionConfig;
use crate::core::error::{BulletinError, BulletinResult};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Longest accepted key label, in bytes.
pub const MAX_LABEL_LEN: usize = 127;

/// A labelled AES-256 key.
#[derive(Clone)]
pub struct Key {
    label: String,
    material: [u8; 32],
}

impl Key {
    /// Derive a key from an operator passphrase.
    pub fn derive(label: impl Into<String>, phrase: &str) -> BulletinResult<Self> {
        let label = label.into();
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(BulletinError::Encryption {
                message: format!(
                    "key label must be 1..={} bytes, got {}",
                    MAX_LABEL_LEN,
                    label.len()
                ),
            });
        }
        if phrase.is_empty() {
            return Err(BulletinError::Encryption {
                message: format!("key {} has an empty passphrase", label),
            });
        }
        let digest = Sha256::digest(phrase.as_bytes());
        let mut material = [0u8; 32];
        material.copy_from_slice(&digest);
        Ok(Self { label, material })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn material(&self) -> &[u8; 32] {
        &self.material
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("label", &self.label).finish()
    }
}

/// Ordered keys with exactly one active (primary) key.
///
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct KeySet {
    active: usize,
    keys: Vec<Key>,
}

impl KeySet {
    /// Build a key set from `(label, phrase)` pairs.
    pub fn new<L, P>(active_label: &str, entries: Vec<(L, P)>) -> BulletinResult<Self>
    where
        L: Into<String>,
        P: AsRef<str>,
    {
        let mut keys = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for (label, phrase) in entries {
            let key = Key::derive(label, phrase.as_ref())?;
            if !seen.insert(key.label.clone()) {
                return Err(BulletinError::Encryption {
                    message: format!("duplicate key label: {}", key.label),
                });
            }
            keys.push(key);
        }

        let active = keys
            .iter()
            .position(|k| k.label == active_label)
            .ok_or_else(|| BulletinError::Encryption {
                message: format!("active key {} is not in the key set", active_label),
            })?;

        Ok(Self { active, keys })
    }

    /// Build from the `[encryption]` config section.
    pub fn from_config(config: &EncryptionConfig) -> BulletinResult<Self> {
        Self::new(
            &config.active_key_label,
            config
                .keys
                .iter()
                .map(|k| (k.label.clone(), k.phrase.clone()))
                .collect(),
        )
    }

    /// The key used for new encryptions.
    pub fn primary(&self) -> &Key {
        &self.keys[self.active]
    }

    /// Look a key up by label, active or retired.
    pub fn get(&self, label: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
