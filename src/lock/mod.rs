//! Cluster-wide leader lock.
//!
//! Exactly one process holds the lock and serves writes. The
//! [`LockMaintainer`] acquires it through a [`CoordinationService`], renews at
//! a third of the TTL, and fails stop when a renewal is rejected.
//!
//! [`BackendCoordinator`] keeps the lock record in the shared store, which is
//! what makes the lock cluster-wide; [`InMemoryCoordinator`] only excludes
//! maintainers within one process.

pub mod backend;
pub mod coordinator;
pub mod lease;
pub mod maintainer;

pub use backend::{lock_record_key, BackendCoordinator, LockRecord};
pub use coordinator::{CoordinationService, InMemoryCoordinator};
pub use maintainer::{lock_released, LockMaintainer, LockState};

use serde::{Deserialize, Serialize};

/// Identity advertised by the lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub id: String,
    pub url: String,
}

impl Presence {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// Presence with a random instance id.
    pub fn generate(url: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), url)
    }
}

/// Coordination-service session owning a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
