//! Acquire-and-hold loop for the cluster-wide lock.

use super::coordinator::CoordinationService;
use super::{Presence, SessionId};
use crate::core::config::LockConfig;
use crate::core::error::{BulletinError, BulletinResult};
use crate::core::time::millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Observable lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    /// Renewal failed; the process must stop serving writes.
    Lost,
}

impl LockState {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unlocked => "unlocked",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Resolve once `status` stops reading `Held`.
///
/// A closed channel leaves the last state in place, so this never resolves
/// if the maintainer went away while the lock still read as held.
pub async fn lock_released(status: &mut watch::Receiver<LockState>) {
    if status.wait_for(|s| !s.is_held()).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Holds the lock for this process.
pub struct LockMaintainer {
    service: Arc<dyn CoordinationService>,
    lock_key: String,
    presence: Presence,
    ttl: Duration,
    retry_interval: Duration,
    state: watch::Sender<LockState>,
}

impl LockMaintainer {
    pub fn new(service: Arc<dyn CoordinationService>, config: &LockConfig, presence: Presence) -> Self {
        let (state, _) = watch::channel(LockState::Unlocked);
        Self {
            service,
            lock_key: config.lock_key.clone(),
            presence,
            ttl: millis(config.ttl_ms),
            retry_interval: millis(config.retry_interval_ms),
            state,
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Interval between renewals.
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(1))
    }

    /// Subscribe to state changes.
    pub fn status(&self) -> watch::Receiver<LockState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LockState) {
        self.state.send_replace(state);
    }

    /// Acquire the lock, signal `ready`, then renew until shutdown or loss.
    ///
    /// Returns `Ok` after a clean shutdown (the lock is released first) and
    /// `LockLost` if a renewal fails.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> BulletinResult<()> {
        self.set_state(LockState::Acquiring);
        tracing::info!(lock_key = %self.lock_key, presence = %self.presence.id, "acquiring lock");

        let session = loop {
            if *shutdown.borrow() {
                self.set_state(LockState::Unlocked);
                return Ok(());
            }
            match self
                .service
                .acquire(&self.lock_key, &self.presence, self.ttl)
                .await
            {
                Ok(session) => break session,
                Err(BulletinError::LockHeld { holder, .. }) => {
                    tracing::debug!(lock_key = %self.lock_key, holder = %holder, "lock held elsewhere");
                }
                Err(e) => {
                    tracing::warn!(lock_key = %self.lock_key, error = %e, "lock acquisition failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        self.set_state(LockState::Unlocked);
                        return Ok(());
                    }
                }
            }
        };

        self.set_state(LockState::Held);
        tracing::info!(lock_key = %self.lock_key, session = %session, "lock acquired");
        let _ = ready.send(());

        self.hold(session, shutdown).await
    }

    async fn hold(&self, session: SessionId, mut shutdown: watch::Receiver<bool>) -> BulletinResult<()> {
        let mut renew = tokio::time::interval(self.renew_interval());
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        renew.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = renew.tick() => {
                    if let Err(e) = self.service.renew(session).await {
                        self.set_state(LockState::Lost);
                        tracing::error!(lock_key = %self.lock_key, session = %session, error = %e, "lock lost");
                        return Err(BulletinError::LockLost {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if let Err(e) = self.service.release(session).await {
            tracing::warn!(lock_key = %self.lock_key, error = %e, "lock release failed");
        }
        self.set_state(LockState::Unlocked);
        tracing::info!(lock_key = %self.lock_key, "lock released");
        Ok(())
    }
}
