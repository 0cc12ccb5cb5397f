//! Typed record store.
//!
//! Wraps a [`Backend`] so callers work in records instead of bytes: values
//! are validated, sealed through the [`RecordCodec`] on the way in, opened on
//! the way out, and every accepted mutation is published on the event hub.

use super::{Backend, StoredRecord};
use crate::core::error::BulletinResult;
use crate::crypto::RecordCodec;
use crate::events::{Event, EventHub};
use crate::models::{Namespace, Record};
use std::marker::PhantomData;
use std::sync::Arc;

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub record: T,
    pub version: u64,
}

/// Typed access to the active backend.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn Backend>,
    codec: RecordCodec,
    events: Option<Arc<EventHub>>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn Backend>, codec: RecordCodec) -> Self {
        Self {
            backend,
            codec,
            events: None,
        }
    }

    /// Publish accepted mutations on `hub`.
    pub fn with_events(mut self, hub: Arc<EventHub>) -> Self {
        self.events = Some(hub);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    fn publish(&self, namespace: Namespace, event: Event) {
        let (Some(hub), Some(category)) = (&self.events, namespace.category()) else {
            return;
        };
        if let Err(e) = hub.publish(category, event) {
            tracing::debug!(namespace = %namespace, error = %e, "event not published");
        }
    }

    fn payload<T: Record>(record: &T) -> serde_json::Value {
        serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
    }

    /// Read and decrypt one record.
    pub async fn get<T: Record>(&self, key: &str) -> BulletinResult<Versioned<T>> {
        let stored = self.backend.get(T::NAMESPACE, key).await?;
        let record = self.codec.decode(&stored.value)?;
        Ok(Versioned {
            record,
            version: stored.version,
        })
    }

    /// Snapshot of every record of type `T`, decoded lazily.
    pub async fn get_all<T: Record>(&self) -> BulletinResult<RecordSet<T>> {
        let records = self.backend.get_all(T::NAMESPACE).await?;
        Ok(RecordSet {
            records: Arc::new(records),
            codec: self.codec.clone(),
            _marker: PhantomData,
        })
    }

    /// Validate, encrypt and insert a new record.
    pub async fn create<T: Record>(&self, record: &T) -> BulletinResult<u64> {
        record.validate()?;
        let key = record.key();
        let value = self.codec.encode(record)?;
        let version = self.backend.create(T::NAMESPACE, &key, value).await?;
        self.publish(T::NAMESPACE, Event::created(key, version, Self::payload(record)));
        Ok(version)
    }

    /// Replace a record read at `expected`.
    pub async fn compare_and_swap<T: Record>(&self, expected: u64, record: &T) -> BulletinResult<u64> {
        record.validate()?;
        let key = record.key();
        let value = self.codec.encode(record)?;
        let version = self
            .backend
            .compare_and_swap(T::NAMESPACE, &key, expected, value)
            .await?;
        self.publish(T::NAMESPACE, Event::changed(key, version, Self::payload(record)));
        Ok(version)
    }

    /// Remove a record read at `expected`.
    pub async fn delete<T: Record>(&self, key: &str, expected: u64) -> BulletinResult<()> {
        self.backend.delete(T::NAMESPACE, key, expected).await?;
        self.publish(T::NAMESPACE, Event::removed(key, expected));
        Ok(())
    }

    pub async fn count<T: Record>(&self) -> BulletinResult<usize> {
        self.backend.count(T::NAMESPACE).await
    }
}

/// Point-in-time set of records.
///
/// Decoding happens per item during iteration; `iter` may be called any
/// number of times and always starts from the beginning of the snapshot.
pub struct RecordSet<T> {
    records: Arc<Vec<StoredRecord>>,
    codec: RecordCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> RecordSet<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys in the snapshot, without decoding.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = BulletinResult<Versioned<T>>> + '_ {
        self.records.iter().map(move |stored| {
            let record = self.codec.decode(&stored.value)?;
            Ok(Versioned {
                record,
                version: stored.version,
            })
        })
    }

    /// Decode everything, failing on the first bad record.
    pub fn collect_all(&self) -> BulletinResult<Vec<Versioned<T>>> {
        self.iter().collect()
    }
}

impl<T> Clone for RecordSet<T> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}
