//! Coordination through the shared backend.
//!
//! The lock is a plaintext [`LockRecord`] in the `meta` namespace naming the
//! holder's presence, its session and a wall-clock deadline. Acquire, renew
//! and release are compare-and-swaps on the record's version, so every
//! process sharing the backend sees one holder. An expired record may be
//! taken over by anyone.

use super::coordinator::CoordinationService;
use super::{Presence, SessionId};
use crate::core::error::{BulletinError, BulletinResult};
use crate::core::time::unix_millis;
use crate::models::Namespace;
use crate::storage::{meta, Backend, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stored lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub presence: Presence,
    pub session: u64,
    pub ttl_ms: u64,
    /// Wall-clock deadline in milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Metadata key holding the record for `lock_key`.
pub fn lock_record_key(lock_key: &str) -> String {
    format!("lock.{}", lock_key.trim_matches('/').replace('/', "."))
}

/// [`CoordinationService`] storing the lock in a [`Backend`].
pub struct BackendCoordinator {
    backend: Arc<dyn Backend>,
    /// Sessions this coordinator granted, by metadata key.
    sessions: Mutex<HashMap<SessionId, String>>,
}

impl BackendCoordinator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn read(&self, key: &str) -> BulletinResult<Option<Versioned<LockRecord>>> {
        meta::read_meta::<LockRecord>(&*self.backend, key).await
    }

    fn lost(&self, session: SessionId, reason: String) -> BulletinError {
        self.sessions.lock().remove(&session);
        BulletinError::LockLost { reason }
    }
}

#[async_trait]
impl CoordinationService for BackendCoordinator {
    async fn acquire(
        &self,
        lock_key: &str,
        presence: &Presence,
        ttl: Duration,
    ) -> BulletinResult<SessionId> {
        let key = lock_record_key(lock_key);
        let now = unix_millis();
        let ttl_ms = ttl.as_millis() as u64;
        let session = SessionId(rand::random());
        let record = LockRecord {
            presence: presence.clone(),
            session: session.0,
            ttl_ms,
            expires_at_ms: now.saturating_add(ttl_ms),
        };

        let written = match self.read(&key).await? {
            None => meta::write_meta(&*self.backend, &key, None, &record).await,
            Some(current) if current.record.is_expired(now) => {
                tracing::info!(
                    lock_key,
                    previous = %current.record.presence.id,
                    "taking over expired lock"
                );
                meta::write_meta(&*self.backend, &key, Some(current.version), &record).await
            }
            Some(current) => {
                return Err(BulletinError::LockHeld {
                    lock_key: lock_key.to_string(),
                    holder: current.record.presence.id,
                })
            }
        };

        match written {
            Ok(_) => {
                self.sessions.lock().insert(session, key);
                Ok(session)
            }
            Err(BulletinError::Conflict { .. } | BulletinError::AlreadyExists { .. }) => {
                let holder = self
                    .read(&key)
                    .await?
                    .map(|v| v.record.presence.id)
                    .unwrap_or_default();
                Err(BulletinError::LockHeld {
                    lock_key: lock_key.to_string(),
                    holder,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn renew(&self, session: SessionId) -> BulletinResult<()> {
        let key = self.sessions.lock().get(&session).cloned();
        let Some(key) = key else {
            return Err(BulletinError::LockLost {
                reason: format!("session {} is not held", session),
            });
        };

        let current = match self.read(&key).await? {
            Some(current) if current.record.session == session.0 => current,
            Some(current) => {
                return Err(self.lost(
                    session,
                    format!("lock taken over by {}", current.record.presence.id),
                ))
            }
            None => return Err(self.lost(session, "lock record removed".to_string())),
        };

        let now = unix_millis();
        if current.record.is_expired(now) {
            return Err(self.lost(session, format!("session {} expired", session)));
        }
        let mut record = current.record;
        record.expires_at_ms = now.saturating_add(record.ttl_ms);
        match meta::write_meta(&*self.backend, &key, Some(current.version), &record).await {
            Ok(_) => Ok(()),
            Err(BulletinError::Conflict { .. } | BulletinError::NotFound { .. }) => {
                Err(self.lost(session, "lock record changed during renewal".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, session: SessionId) -> BulletinResult<()> {
        let key = self.sessions.lock().remove(&session);
        let Some(key) = key else {
            return Ok(());
        };
        let Some(current) = self.read(&key).await? else {
            return Ok(());
        };
        if current.record.session != session.0 {
            return Ok(());
        }
        match self.backend.delete(Namespace::Meta, &key, current.version).await {
            Ok(()) | Err(BulletinError::NotFound { .. } | BulletinError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn holder(&self, lock_key: &str) -> BulletinResult<Option<Presence>> {
        let now = unix_millis();
        Ok(self
            .read(&lock_record_key(lock_key))
            .await?
            .filter(|v| !v.record.is_expired(now))
            .map(|v| v.record.presence))
    }
}
