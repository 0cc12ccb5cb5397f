//! Envelope encryption with AES-256-GCM.

use super::keys::KeySet;
use crate::core::error::{BulletinError, BulletinResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Ciphertext plus the label of the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub key_label: String,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Encrypts under the primary key, decrypts under any key in the set.
#[derive(Debug, Clone)]
pub struct Cryptor {
    keys: KeySet,
}

impl Cryptor {
    pub fn new(keys: KeySet) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    /// Label of the key new envelopes are sealed with.
    pub fn primary_label(&self) -> &str {
        self.keys.primary().label()
    }

    /// Seal `plaintext` under the primary key with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> BulletinResult<Envelope> {
        let key = self.keys.primary();
        let cipher = Aes256Gcm::new_from_slice(key.material()).map_err(|e| {
            BulletinError::Encryption {
                message: format!("invalid key {}: {e}", key.label()),
            }
        })?;

        let mut nonce = [0u8; 12];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| BulletinError::Encryption {
                message: format!("random source unavailable: {e}"),
            })?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| BulletinError::Encryption {
                message: format!("seal failed: {e}"),
            })?;

        Ok(Envelope {
            key_label: key.label().to_string(),
            nonce,
            ciphertext,
        })
    }

    /// Open an envelope with whichever key its label names.
    pub fn decrypt(&self, envelope: &Envelope) -> BulletinResult<Vec<u8>> {
        let key = self
            .keys
            .get(&envelope.key_label)
            .ok_or_else(|| BulletinError::UnknownKey {
                label: envelope.key_label.clone(),
            })?;
        let cipher = Aes256Gcm::new_from_slice(key.material()).map_err(|e| {
            BulletinError::DecryptionFailed {
                label: envelope.key_label.clone(),
                reason: format!("invalid key: {e}"),
            }
        })?;

        cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| BulletinError::DecryptionFailed {
                label: envelope.key_label.clone(),
                reason: "authentication tag mismatch".to_string(),
            })
    }
}
