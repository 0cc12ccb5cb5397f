//! Coordination service interface and the in-process implementation.

use super::lease::{Acquire, LeaseTable};
use super::{Presence, SessionId};
use crate::core::error::{BulletinError, BulletinResult};
use crate::core::time::TickClock;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// A service granting TTL-bounded exclusive locks.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Try once to take `lock_key`. `LockHeld` if another presence has it.
    async fn acquire(
        &self,
        lock_key: &str,
        presence: &Presence,
        ttl: Duration,
    ) -> BulletinResult<SessionId>;

    /// Extend the session's lease. `LockLost` if it is gone.
    async fn renew(&self, session: SessionId) -> BulletinResult<()>;

    /// Give the lock up. Releasing an unknown session is not an error.
    async fn release(&self, session: SessionId) -> BulletinResult<()>;

    /// Current holder of `lock_key`.
    async fn holder(&self, lock_key: &str) -> BulletinResult<Option<Presence>>;
}

/// Single-process coordinator over a [`LeaseTable`].
///
/// Suitable for single-node deployments and tests; [`revoke`](Self::revoke)
/// simulates the coordination service dropping a session.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    table: Mutex<LeaseTable>,
    clock: TickClock,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LeaseTable::new()),
            clock: TickClock::new(),
        }
    }

    /// Drop a session's lease as if it expired. Returns whether one existed.
    pub fn revoke(&self, session: SessionId) -> bool {
        let revoked = self.table.lock().revoke(session);
        if let Some(lease) = &revoked {
            tracing::warn!(
                lock_key = %lease.lock_key,
                session = %session,
                "lock session revoked"
            );
        }
        revoked.is_some()
    }

    /// Session currently holding `lock_key`.
    pub fn session_of(&self, lock_key: &str) -> Option<SessionId> {
        let now = self.clock.now();
        self.table.lock().get(lock_key, now).map(|l| l.session)
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordinator {
    async fn acquire(
        &self,
        lock_key: &str,
        presence: &Presence,
        ttl: Duration,
    ) -> BulletinResult<SessionId> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        table.collect_expired(now);
        match table.acquire(lock_key, presence, ttl.as_millis() as u64, now) {
            Acquire::Granted(session) => Ok(session),
            Acquire::Held(holder) => Err(BulletinError::LockHeld {
                lock_key: lock_key.to_string(),
                holder: holder.id,
            }),
        }
    }

    async fn renew(&self, session: SessionId) -> BulletinResult<()> {
        let now = self.clock.now();
        if self.table.lock().keepalive(session, now) {
            Ok(())
        } else {
            Err(BulletinError::LockLost {
                reason: format!("session {} expired or revoked", session),
            })
        }
    }

    async fn release(&self, session: SessionId) -> BulletinResult<()> {
        self.table.lock().revoke(session);
        Ok(())
    }

    async fn holder(&self, lock_key: &str) -> BulletinResult<Option<Presence>> {
        let now = self.clock.now();
        Ok(self.table.lock().get(lock_key, now).map(|l| l.holder.clone()))
    }
}
