//! Lease table backing the in-process coordinator.
//!
//! One lease per lock key. A lease stays valid until its keepalive deadline
//! passes; an expired lease is replaced by the next acquirer.

use super::{Presence, SessionId};
use crate::core::time::Tick;

/// A granted lock lease.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub lock_key: String,
    pub holder: Presence,
    pub session: SessionId,
    pub ttl_ms: u64,
    pub granted_at: Tick,
    pub keepalive_deadline: Tick,
}

impl LockLease {
    fn new(lock_key: &str, holder: Presence, session: SessionId, ttl_ms: u64, now: Tick) -> Self {
        Self {
            lock_key: lock_key.to_string(),
            holder,
            session,
            ttl_ms,
            granted_at: now,
            keepalive_deadline: now.add_ms(ttl_ms),
        }
    }

    pub fn is_expired_at(&self, tick: Tick) -> bool {
        tick.is_at_or_after(self.keepalive_deadline)
    }

    pub fn remaining_ttl_at(&self, tick: Tick) -> u64 {
        tick.ms_until(self.keepalive_deadline)
    }

    fn keepalive(&mut self, now: Tick) {
        self.keepalive_deadline = now.add_ms(self.ttl_ms);
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(SessionId),
    Held(Presence),
}

/// Lock leases indexed by lock key.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: std::collections::HashMap<String, LockLease>,
    next_session: u64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the lock unless another presence holds a live lease.
    ///
    /// A presence re-acquiring its own lock gets a fresh session.
    pub fn acquire(&mut self, lock_key: &str, presence: &Presence, ttl_ms: u64, now: Tick) -> Acquire {
        if let Some(existing) = self.leases.get(lock_key) {
            if !existing.is_expired_at(now) && existing.holder.id != presence.id {
                return Acquire::Held(existing.holder.clone());
            }
        }
        self.next_session += 1;
        let session = SessionId(self.next_session);
        self.leases.insert(
            lock_key.to_string(),
            LockLease::new(lock_key, presence.clone(), session, ttl_ms, now),
        );
        Acquire::Granted(session)
    }

    fn find_mut(&mut self, session: SessionId) -> Option<&mut LockLease> {
        self.leases.values_mut().find(|l| l.session == session)
    }

    /// Extend a live lease. `false` if the session is unknown or expired.
    pub fn keepalive(&mut self, session: SessionId, now: Tick) -> bool {
        match self.find_mut(session) {
            Some(lease) if !lease.is_expired_at(now) => {
                lease.keepalive(now);
                true
            }
            _ => false,
        }
    }

    /// Drop the lease owned by `session`.
    pub fn revoke(&mut self, session: SessionId) -> Option<LockLease> {
        let key = self
            .leases
            .iter()
            .find(|(_, l)| l.session == session)
            .map(|(k, _)| k.clone())?;
        self.leases.remove(&key)
    }

    /// Live lease for a lock key.
    pub fn get(&self, lock_key: &str, now: Tick) -> Option<&LockLease> {
        self.leases.get(lock_key).filter(|l| !l.is_expired_at(now))
    }

    /// Remove every expired lease, returning their lock keys.
    pub fn collect_expired(&mut self, now: Tick) -> Vec<String> {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, l)| l.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.leases.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(id: &str) -> Presence {
        Presence::new(id, format!("http://{}:8889", id))
    }

    #[test]
    fn test_lease_blocks_other_presence_until_expiry() {
        let mut table = LeaseTable::new();
        let a = presence("a");
        let b = presence("b");

        assert!(matches!(table.acquire("lock", &a, 100, Tick::new(0)), Acquire::Granted(_)));
        assert_eq!(
            table.acquire("lock", &b, 100, Tick::new(50)),
            Acquire::Held(a.clone())
        );
        assert!(matches!(table.acquire("lock", &b, 100, Tick::new(100)), Acquire::Granted(_)));
    }

    #[test]
    fn test_keepalive_extends_and_rejects_expired() {
        let mut table = LeaseTable::new();
        let a = presence("a");
        let Acquire::Granted(session) = table.acquire("lock", &a, 100, Tick::new(0)) else {
            panic!("expected grant");
        };
        assert!(table.keepalive(session, Tick::new(90)));
        assert_eq!(table.get("lock", Tick::new(150)).unwrap().remaining_ttl_at(Tick::new(150)), 40);
        assert!(!table.keepalive(session, Tick::new(190)));
        assert_eq!(table.collect_expired(Tick::new(190)), vec!["lock".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_revoke_removes_lease() {
        let mut table = LeaseTable::new();
        let Acquire::Granted(session) = table.acquire("lock", &presence("a"), 100, Tick::new(0)) else {
            panic!("expected grant");
        };
        assert!(table.revoke(session).is_some());
        assert!(table.get("lock", Tick::new(1)).is_none());
        assert!(!table.keepalive(session, Tick::new(1)));
    }
}
