//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store → lock → migrations → key rotation → work pool → convergence
//! - Shutdown order: convergence → work pool → event hub → lock → store
//!
//! Migrations and key rotation are abandoned the moment the lock stops
//! reading held.

use crate::convergence::{ConvergenceDriver, TaskResolver};
use crate::core::config::Config;
use crate::core::error::BulletinResult;
use crate::core::time::millis;
use crate::crypto::{Cryptor, KeyRotator, KeySet, RecordCodec};
use crate::events::EventHub;
use crate::lock::{
    lock_released, BackendCoordinator, CoordinationService, InMemoryCoordinator, LockMaintainer,
    LockState, Presence,
};
use crate::migration::{builtin_migrations, MigrationContext, MigrationManager, Readiness};
use crate::storage::{open_backend, Backend, Engine, RecordStore};
use crate::workpool::{CallbackClient, CallbackWorkPool, HttpCallbackClient, WorkPoolConfig};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// How long `stop` waits for a background task to notice shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub store: ComponentHealth,
    pub lock: ComponentHealth,
    pub migrations: ComponentHealth,
    pub work_pool: ComponentHealth,
    pub convergence: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            store: ComponentHealth::Starting,
            lock: ComponentHealth::Starting,
            migrations: ComponentHealth::Starting,
            work_pool: ComponentHealth::Starting,
            convergence: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime may serve writes.
    pub fn is_ready(&self) -> bool {
        [
            self.store,
            self.lock,
            self.migrations,
            self.work_pool,
            self.convergence,
        ]
        .iter()
        .all(|h| *h == ComponentHealth::Healthy)
    }

    /// Check if the runtime is alive (no component failed).
    pub fn is_alive(&self) -> bool {
        ![
            self.store,
            self.lock,
            self.migrations,
            self.work_pool,
            self.convergence,
        ]
        .contains(&ComponentHealth::Failed)
    }
}

/// Bulletin runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    presence: Presence,
    coordinator: Option<Arc<dyn CoordinationService>>,
    callback_client: Option<Arc<dyn CallbackClient>>,
    backend: Option<Arc<dyn Backend>>,
    legacy: Option<Arc<dyn Backend>>,
    hub: Arc<EventHub>,
    store: Option<RecordStore>,
    lock: Option<Arc<LockMaintainer>>,
    lock_handle: Option<JoinHandle<BulletinResult<()>>>,
    readiness: Option<Readiness>,
    pool: Option<Arc<CallbackWorkPool>>,
    convergence_handle: Option<JoinHandle<BulletinResult<()>>>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let presence = Presence::generate(config.lock.advertise_url.clone());
        let hub = Arc::new(EventHub::new(config.hub.subscriber_buffer));

        Ok(Self {
            config: Arc::new(config),
            presence,
            coordinator: None,
            callback_client: None,
            backend: None,
            legacy: None,
            hub,
            store: None,
            lock: None,
            lock_handle: None,
            readiness: None,
            pool: None,
            convergence_handle: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Use `coordinator` instead of the one named by `lock.coordinator`.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinationService>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Deliver callbacks through `client` instead of HTTP.
    pub fn with_callback_client(mut self, client: Arc<dyn CallbackClient>) -> Self {
        self.callback_client = Some(client);
        self
    }

    /// Use already-open engines instead of opening them from configuration.
    pub fn with_backends(mut self, active: Arc<dyn Backend>, legacy: Option<Arc<dyn Backend>>) -> Self {
        self.backend = Some(active);
        self.legacy = legacy;
        self
    }

    /// Use a fixed presence identity.
    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Typed record access (after `start`).
    pub fn store(&self) -> Option<&RecordStore> {
        self.store.as_ref()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Migration readiness (after `start`).
    pub fn readiness(&self) -> Option<Readiness> {
        self.readiness.clone()
    }

    pub fn lock_status(&self) -> Option<watch::Receiver<LockState>> {
        self.lock.as_ref().map(|l| l.status())
    }

    pub fn work_pool(&self) -> Option<&Arc<CallbackWorkPool>> {
        self.pool.as_ref()
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Blocks until this process holds the lock and migrations are complete.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            engine = %self.config.backend.engine,
            presence = %self.presence.id,
            "starting Bulletin runtime"
        );

        self.init_store()?;
        self.init_lock().await?;

        // Nothing may write once the lock is gone.
        let mut lock_status = self.lock.as_ref().context("lock not initialized")?.status();
        let prepared = tokio::select! {
            result = self.prepare_store() => Some(result),
            _ = lock_released(&mut lock_status) => None,
        };
        match prepared {
            Some(result) => result?,
            None if *self.shutdown_rx.borrow() => {
                self.stop().await?;
                anyhow::bail!("shutdown requested during startup");
            }
            None => return self.abort_lock_lost().await,
        }

        self.init_work_pool()?;
        self.init_convergence();

        self.running.store(true, Ordering::Release);
        tracing::info!("Bulletin runtime started");
        Ok(())
    }

    /// Migrations, then key rotation. Runs only while the lock is held.
    async fn prepare_store(&mut self) -> Result<()> {
        self.run_migrations().await?;
        self.rotate_keys().await
    }

    /// Stop after the lock was lost during startup.
    async fn abort_lock_lost(&mut self) -> Result<()> {
        self.health.lock = ComponentHealth::Failed;
        if self.health.migrations != ComponentHealth::Healthy {
            self.health.migrations = ComponentHealth::Failed;
        }
        let reason = match self.lock_handle.take() {
            Some(handle) => match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Ok(Ok(()))) => "lock maintainer exited".to_string(),
                Ok(Err(e)) => format!("lock maintainer panicked: {e}"),
                Err(_) => "lock maintainer did not stop".to_string(),
            },
            None => "lock maintainer missing".to_string(),
        };
        tracing::error!(reason = %reason, "lock lost during startup, stopping");
        self.stop().await?;
        anyhow::bail!("lock lost during startup: {}", reason)
    }

    fn coordinator(&self) -> Result<Arc<dyn CoordinationService>> {
        if let Some(coordinator) = &self.coordinator {
            return Ok(coordinator.clone());
        }
        match self.config.lock.coordinator.as_str() {
            "memory" => Ok(Arc::new(InMemoryCoordinator::new())),
            _ => {
                let backend = self.backend.clone().context("backend not initialized")?;
                Ok(Arc::new(BackendCoordinator::new(backend)))
            }
        }
    }

    fn codec(&self) -> Result<RecordCodec> {
        let keys = KeySet::from_config(&self.config.encryption).context("invalid encryption keys")?;
        Ok(RecordCodec::new(Arc::new(Cryptor::new(keys))))
    }

    /// Open the active (and legacy) engine.
    fn init_store(&mut self) -> Result<()> {
        tracing::debug!("initializing store");

        if self.backend.is_none() {
            let engine = Engine::parse(&self.config.backend.engine)
                .with_context(|| format!("unknown engine: {}", self.config.backend.engine))?;
            self.backend = Some(open_backend(&self.config.backend, engine)?);

            if let Some(name) = &self.config.backend.legacy_engine {
                let legacy = Engine::parse(name).with_context(|| format!("unknown engine: {}", name))?;
                self.legacy = Some(open_backend(&self.config.backend, legacy)?);
            }
        }
        let backend = self.backend.clone().context("backend not initialized")?;

        let store = RecordStore::new(backend.clone(), self.codec()?).with_events(self.hub.clone());
        self.store = Some(store);
        self.health.store = ComponentHealth::Healthy;

        tracing::info!(
            engine = %backend.engine(),
            legacy = ?self.legacy.as_ref().map(|l| l.engine()),
            "store initialized"
        );
        Ok(())
    }

    /// Spawn the lock maintainer and wait until the lock is held.
    async fn init_lock(&mut self) -> Result<()> {
        tracing::debug!("acquiring lock");

        let coordinator = self.coordinator()?;
        let maintainer = Arc::new(LockMaintainer::new(
            coordinator,
            &self.config.lock,
            self.presence.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = self.shutdown_rx.clone();
        let task = maintainer.clone();
        let handle = tokio::spawn(async move { task.run(shutdown, ready_tx).await });
        self.lock = Some(maintainer);

        match ready_rx.await {
            Ok(()) => {
                self.lock_handle = Some(handle);
                self.health.lock = ComponentHealth::Healthy;
                tracing::info!("lock held");
                Ok(())
            }
            Err(_) => {
                // The maintainer returned without ever holding the lock.
                self.health.lock = ComponentHealth::Stopped;
                match handle.await {
                    Ok(Err(e)) => Err(e).context("lock maintainer failed"),
                    Ok(Ok(())) => anyhow::bail!("shutdown requested before the lock was acquired"),
                    Err(e) => Err(e).context("lock maintainer panicked"),
                }
            }
        }
    }

    /// Run the migration pipeline to completion.
    async fn run_migrations(&mut self) -> Result<()> {
        tracing::debug!("running migrations");

        let backend = self.backend.clone().context("backend not initialized")?;
        let lock = self.lock.as_ref().context("lock not initialized")?;
        let mut ctx = MigrationContext::new(backend, self.codec()?);
        if let Some(legacy) = &self.legacy {
            ctx = ctx.with_legacy(legacy.clone());
        }

        let manager = MigrationManager::new(
            ctx,
            builtin_migrations(),
            lock.status(),
            millis(self.config.migration.poll_interval_ms),
        )?;
        self.readiness = Some(manager.readiness());

        if let Err(e) = manager.run(self.shutdown_rx.clone()).await {
            self.health.migrations = ComponentHealth::Failed;
            return Err(e).context("migrations failed");
        }
        self.health.migrations = ComponentHealth::Healthy;
        Ok(())
    }

    /// Reseal records still under a retired key.
    async fn rotate_keys(&mut self) -> Result<()> {
        let backend = self.backend.clone().context("backend not initialized")?;
        let rotator = KeyRotator::new(backend, self.codec()?);
        if rotator.is_current().await? {
            tracing::debug!("records already sealed under the primary key");
            return Ok(());
        }
        rotator.rotate().await.context("key rotation failed")?;
        Ok(())
    }

    fn init_work_pool(&mut self) -> Result<()> {
        tracing::debug!("starting callback work pool");

        let client: Arc<dyn CallbackClient> = match &self.callback_client {
            Some(client) => client.clone(),
            None => Arc::new(HttpCallbackClient::new(millis(
                self.config.workers.request_timeout_ms,
            ))?),
        };
        let store = self.store.clone().context("store not initialized")?;
        let pool = CallbackWorkPool::start(
            WorkPoolConfig::from_config(&self.config.workers),
            client,
            Some(Arc::new(TaskResolver::new(store))),
        );
        self.pool = Some(Arc::new(pool));
        self.health.work_pool = ComponentHealth::Healthy;
        Ok(())
    }

    fn init_convergence(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let mut driver = ConvergenceDriver::new(store, millis(self.config.convergence.interval_ms))
            .with_kick_task_duration(millis(self.config.convergence.kick_task_duration_ms));
        if let Some(pool) = &self.pool {
            driver = driver.with_work_pool(pool.clone());
        }
        let shutdown = self.shutdown_rx.clone();
        self.convergence_handle = Some(tokio::spawn(async move { driver.run(shutdown).await }));
        self.health.convergence = ComponentHealth::Healthy;
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c, a shutdown request, or lock loss.
    ///
    /// Losing the lock stops every component and returns an error.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let lock_handle = self.lock_handle.take();
        let mut lock_lost = None;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
            result = async {
                match lock_handle {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                self.health.lock = ComponentHealth::Failed;
                let reason = match result {
                    Ok(Ok(())) => "lock maintainer exited".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("lock maintainer panicked: {e}"),
                };
                tracing::error!(reason = %reason, "lock lost, stopping");
                lock_lost = Some(reason);
            }
        }

        self.stop().await?;
        match lock_lost {
            Some(reason) => anyhow::bail!("lock lost: {}", reason),
            None => Ok(()),
        }
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Bulletin runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.convergence_handle.take() {
            self.health.convergence = ComponentHealth::Stopping;
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!("convergence stop timed out");
            }
            self.health.convergence = ComponentHealth::Stopped;
        }

        if let Some(pool) = self.pool.take() {
            self.health.work_pool = ComponentHealth::Stopping;
            pool.shutdown().await;
            self.health.work_pool = ComponentHealth::Stopped;
        }

        self.hub.close();

        if let Some(handle) = self.lock_handle.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => tracing::debug!("lock maintainer stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "lock maintainer stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "lock maintainer task panicked"),
                Err(_) => tracing::warn!("lock release timed out"),
            }
        }
        if self.health.lock != ComponentHealth::Failed {
            self.health.lock = ComponentHealth::Stopped;
        }
        if self.health.migrations == ComponentHealth::Healthy {
            self.health.migrations = ComponentHealth::Stopped;
        }

        self.store = None;
        self.health.store = ComponentHealth::Stopped;

        tracing::info!("Bulletin runtime stopped");
        Ok(())
    }
}
