//! Stored record encoding.
//!
//! Every value written to a backend is `[format][schema][body]`:
//!
//! ```text
//! +--------+--------+------------------------------------------+
//! | format | schema | body                                     |
//! |  (u8)  |  (u8)  | Plain: JSON / Encrypted: bincode Envelope |
//! +--------+--------+------------------------------------------+
//! ```
//!
//! Values written before the header existed are bare JSON objects and are
//! read as `Plain` at schema 0.

use super::cryptor::{Cryptor, Envelope};
use crate::core::error::{BulletinError, BulletinResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Schema version stamped on newly written records.
pub const CURRENT_SCHEMA: u8 = 1;

const HEADER_LEN: usize = 2;

/// Body format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Format {
    Plain = 0,
    Encrypted = 1,
}

impl Format {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Plain),
            1 => Some(Self::Encrypted),
            _ => None,
        }
    }
}

/// Decoded stored value, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Plain(Vec<u8>),
    Encrypted(Envelope),
}

/// Header and payload of a stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspected {
    pub schema: u8,
    pub payload: Payload,
}

impl Inspected {
    pub fn format(&self) -> Format {
        match self.payload {
            Payload::Plain(_) => Format::Plain,
            Payload::Encrypted(_) => Format::Encrypted,
        }
    }

    /// Label of the sealing key, if encrypted.
    pub fn key_label(&self) -> Option<&str> {
        match &self.payload {
            Payload::Encrypted(env) => Some(&env.key_label),
            Payload::Plain(_) => None,
        }
    }
}

/// Serializes records to JSON and seals them through the [`Cryptor`].
#[derive(Debug, Clone)]
pub struct RecordCodec {
    cryptor: Arc<Cryptor>,
}

impl RecordCodec {
    pub fn new(cryptor: Arc<Cryptor>) -> Self {
        Self { cryptor }
    }

    pub fn cryptor(&self) -> &Arc<Cryptor> {
        &self.cryptor
    }

    /// Encode and encrypt a record.
    pub fn encode<T: Serialize>(&self, record: &T) -> BulletinResult<Vec<u8>> {
        let json = serde_json::to_vec(record)
            .map_err(|e| BulletinError::invalid(format!("serialize: {e}")))?;
        self.seal(&json)
    }

    /// Encode without encryption. Used for store metadata only.
    pub fn encode_plain<T: Serialize>(record: &T) -> BulletinResult<Vec<u8>> {
        let json = serde_json::to_vec(record)
            .map_err(|e| BulletinError::invalid(format!("serialize: {e}")))?;
        let mut out = Vec::with_capacity(HEADER_LEN + json.len());
        out.push(Format::Plain as u8);
        out.push(CURRENT_SCHEMA);
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Encrypt already-serialized JSON.
    pub fn seal(&self, json: &[u8]) -> BulletinResult<Vec<u8>> {
        let envelope = self.cryptor.encrypt(json)?;
        let body = bincode::serialize(&envelope)
            .map_err(|e| BulletinError::Encryption {
                message: format!("envelope encode: {e}"),
            })?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(Format::Encrypted as u8);
        out.push(CURRENT_SCHEMA);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Split a stored value into header and payload without decrypting.
    pub fn inspect(bytes: &[u8]) -> BulletinResult<Inspected> {
        if bytes.first() == Some(&b'{') {
            return Ok(Inspected {
                schema: 0,
                payload: Payload::Plain(bytes.to_vec()),
            });
        }
        if bytes.len() < HEADER_LEN {
            return Err(BulletinError::invalid("stored value shorter than header"));
        }
        let format = Format::from_byte(bytes[0])
            .ok_or_else(|| BulletinError::invalid(format!("unknown format tag {}", bytes[0])))?;
        let schema = bytes[1];
        let body = &bytes[HEADER_LEN..];
        let payload = match format {
            Format::Plain => Payload::Plain(body.to_vec()),
            Format::Encrypted => {
                let envelope: Envelope = bincode::deserialize(body)
                    .map_err(|e| BulletinError::invalid(format!("malformed envelope: {e}")))?;
                Payload::Encrypted(envelope)
            }
        };
        Ok(Inspected { schema, payload })
    }

    /// Recover the plaintext JSON of a stored value.
    pub fn open(&self, bytes: &[u8]) -> BulletinResult<Vec<u8>> {
        match Self::inspect(bytes)?.payload {
            Payload::Plain(json) => Ok(json),
            Payload::Encrypted(envelope) => self.cryptor.decrypt(&envelope),
        }
    }

    /// Decode a stored value into a record.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BulletinResult<T> {
        let json = self.open(bytes)?;
        serde_json::from_slice(&json)
            .map_err(|e| BulletinError::invalid(format!("deserialize: {e}")))
    }

    /// Decode a metadata value written with [`encode_plain`](Self::encode_plain).
    pub fn decode_plain<T: DeserializeOwned>(bytes: &[u8]) -> BulletinResult<T> {
        match Self::inspect(bytes)?.payload {
            Payload::Plain(json) => serde_json::from_slice(&json)
                .map_err(|e| BulletinError::invalid(format!("deserialize: {e}"))),
            Payload::Encrypted(_) => Err(BulletinError::invalid(
                "metadata value is unexpectedly encrypted",
            )),
        }
    }

    /// Whether a stored value is sealed under the primary key at the
    /// current schema.
    pub fn is_current(&self, bytes: &[u8]) -> BulletinResult<bool> {
        let inspected = Self::inspect(bytes)?;
        Ok(inspected.schema == CURRENT_SCHEMA
            && inspected.key_label() == Some(self.cryptor.primary_label()))
    }

    /// Re-encode a stored value under the primary key.
    ///
    /// Returns `None` when the value is already current.
    pub fn reseal(&self, bytes: &[u8]) -> BulletinResult<Option<Vec<u8>>> {
        if self.is_current(bytes)? {
            return Ok(None);
        }
        let json = self.open(bytes)?;
        self.seal(&json).map(Some)
    }
}
