//! Migration manager and readiness signal.

use super::{Migration, MigrationContext};
use crate::core::error::{BulletinError, BulletinResult};
use crate::lock::{lock_released, LockState};
use crate::models::Namespace;
use crate::storage::meta::{self, VERSION_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Stored schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub current_version: u64,
    pub target_version: u64,
}

/// Pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Running,
    Complete,
    Fatal(String),
}

/// Set-once readiness signal.
#[derive(Clone)]
pub struct Readiness {
    rx: watch::Receiver<MigrationState>,
}

impl Readiness {
    pub fn state(&self) -> MigrationState {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.rx.borrow(), MigrationState::Complete)
    }

    /// Wait until migrations complete.
    ///
    /// Fails with `MigrationFatal` if the pipeline failed or the manager
    /// went away before completing.
    pub async fn wait(&mut self) -> BulletinResult<()> {
        let state = self
            .rx
            .wait_for(|s| matches!(s, MigrationState::Complete | MigrationState::Fatal(_)))
            .await
            .map(|s| s.clone())
            .map_err(|_| BulletinError::MigrationFatal {
                version: 0,
                message: "migration manager stopped before completing".to_string(),
            })?;
        match state {
            MigrationState::Fatal(message) => Err(BulletinError::MigrationFatal { version: 0, message }),
            _ => Ok(()),
        }
    }
}

/// Runs registered migrations once the lock is held.
pub struct MigrationManager {
    ctx: MigrationContext,
    migrations: Vec<Arc<dyn Migration>>,
    lock: watch::Receiver<LockState>,
    poll_interval: Duration,
    state: watch::Sender<MigrationState>,
}

impl MigrationManager {
    /// Build a manager over a registry. Duplicate versions are rejected.
    pub fn new(
        ctx: MigrationContext,
        mut migrations: Vec<Arc<dyn Migration>>,
        lock: watch::Receiver<LockState>,
        poll_interval: Duration,
    ) -> BulletinResult<Self> {
        let mut seen = HashSet::new();
        for m in &migrations {
            if m.version() == 0 || !seen.insert(m.version()) {
                return Err(BulletinError::MigrationFatal {
                    version: m.version(),
                    message: format!("migration {} has a duplicate or zero version", m.name()),
                });
            }
        }
        migrations.sort_by_key(|m| m.version());
        let (state, _) = watch::channel(MigrationState::Pending);
        Ok(Self {
            ctx,
            migrations,
            lock,
            poll_interval,
            state,
        })
    }

    /// Version the store is at once every registered migration has run.
    pub fn target_version(&self) -> u64 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            rx: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state.borrow().clone()
    }

    /// Fail the pipeline unless this process still holds the lock.
    fn ensure_held(&self, version: u64) -> BulletinResult<()> {
        if self.lock.borrow().is_held() {
            return Ok(());
        }
        let state = *self.lock.borrow();
        Err(self.fatal(version, format!("lock {state} while migrating, stopping")))
    }

    fn fatal(&self, version: u64, message: String) -> BulletinError {
        tracing::error!(version, error = %message, "migration failed");
        self.state.send_replace(MigrationState::Fatal(message.clone()));
        BulletinError::MigrationFatal { version, message }
    }

    /// Drive the pipeline to completion.
    ///
    /// Returns once the store is at the target version, on shutdown (state
    /// stays `Pending`), or with `MigrationFatal`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BulletinResult<()> {
        match self.state() {
            MigrationState::Complete => return Ok(()),
            MigrationState::Fatal(message) => {
                return Err(BulletinError::MigrationFatal { version: 0, message })
            }
            _ => {}
        }

        let mut lock = self.lock.clone();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if lock.borrow().is_held() {
                return self.migrate().await;
            }

            match meta::read_meta::<VersionRecord>(&*self.ctx.backend, VERSION_KEY).await {
                Ok(Some(stored)) if stored.record.current_version > self.target_version() => {
                    return Err(self.fatal(
                        stored.record.current_version,
                        format!(
                            "stored version {} is newer than supported version {}",
                            stored.record.current_version,
                            self.target_version()
                        ),
                    ));
                }
                Ok(Some(stored)) if stored.record.current_version == self.target_version() => {
                    self.state.send_replace(MigrationState::Complete);
                    tracing::info!(version = self.target_version(), "migrations completed by lock holder");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to read schema version"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = lock.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn is_fresh(&self) -> BulletinResult<bool> {
        for namespace in Namespace::RECORDS {
            if self.ctx.backend.count(namespace).await? > 0 {
                return Ok(false);
            }
            if let Some(legacy) = &self.ctx.legacy {
                if legacy.count(namespace).await? > 0 {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Apply pending migrations. Caller holds the lock.
    async fn migrate(&self) -> BulletinResult<()> {
        self.state.send_replace(MigrationState::Running);
        let target = self.target_version();
        let backend = &*self.ctx.backend;

        let stored = meta::read_meta::<VersionRecord>(backend, VERSION_KEY)
            .await
            .map_err(|e| self.fatal(0, format!("read schema version: {e}")))?;

        let (mut record, mut meta_version) = match stored {
            Some(v) => (v.record, Some(v.version)),
            None => {
                let fresh = self
                    .is_fresh()
                    .await
                    .map_err(|e| self.fatal(0, format!("inspect store: {e}")))?;
                if fresh {
                    self.ensure_held(target)?;
                    let record = VersionRecord {
                        current_version: target,
                        target_version: target,
                    };
                    meta::write_meta(backend, VERSION_KEY, None, &record)
                        .await
                        .map_err(|e| self.fatal(target, format!("write schema version: {e}")))?;
                    tracing::info!(version = target, "fresh store, recorded schema version");
                    self.state.send_replace(MigrationState::Complete);
                    return Ok(());
                }
                (
                    VersionRecord {
                        current_version: 0,
                        target_version: target,
                    },
                    None,
                )
            }
        };

        if record.current_version > target {
            return Err(self.fatal(
                record.current_version,
                format!(
                    "stored version {} is newer than supported version {}",
                    record.current_version, target
                ),
            ));
        }

        let pending: Vec<_> = self
            .migrations
            .iter()
            .filter(|m| m.version() > record.current_version)
            .collect();
        tracing::info!(
            current = record.current_version,
            target,
            pending = pending.len(),
            "running migrations"
        );

        if record.target_version != target || meta_version.is_none() {
            self.ensure_held(record.current_version)?;
            record.target_version = target;
            meta_version = Some(
                meta::write_meta(backend, VERSION_KEY, meta_version, &record)
                    .await
                    .map_err(|e| self.fatal(record.current_version, format!("write schema version: {e}")))?,
            );
        }

        let mut lock = self.lock.clone();
        for migration in pending {
            let version = migration.version();
            self.ensure_held(version)?;
            tracing::info!(version, name = migration.name(), "applying migration");
            tokio::select! {
                result = migration.up(&self.ctx) => {
                    result.map_err(|e| self.fatal(version, format!("{}: {e}", migration.name())))?;
                }
                _ = lock_released(&mut lock) => {
                    // Migrations are rerunnable; dropping `up` part-way is safe.
                    return Err(self.fatal(version, format!("lock lost while applying {}", migration.name())));
                }
            }

            self.ensure_held(version)?;
            record.current_version = version;
            meta_version = Some(
                meta::write_meta(backend, VERSION_KEY, meta_version, &record)
                    .await
                    .map_err(|e| self.fatal(version, format!("write schema version: {e}")))?,
            );
        }

        self.state.send_replace(MigrationState::Complete);
        tracing::info!(version = target, "migrations complete");
        Ok(())
    }
}

