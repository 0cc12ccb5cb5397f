//! Callback worker pool.

use super::client::{CallbackClient, DeliveryError};
use crate::core::config::WorkersConfig;
use crate::core::error::{BulletinError, BulletinResult};
use crate::core::time::millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A completion callback to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackJob {
    pub task_guid: String,
    pub url: String,
    pub payload: serde_json::Value,
}

impl CallbackJob {
    pub fn new(task_guid: impl Into<String>, url: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_guid: task_guid.into(),
            url: url.into(),
            payload,
        }
    }
}

/// Notified with the final outcome of each job.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_delivered(&self, job: &CallbackJob);

    async fn on_failed(&self, job: &CallbackJob, error: &DeliveryError) {
        let _ = (job, error);
    }
}

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPolicy {
    /// Wait for space.
    Block,
    /// Fail with `PoolSaturated`.
    Reject,
}

impl SubmissionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block" => Some(Self::Block),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Pool sizing and retry policy.
#[derive(Debug, Clone)]
pub struct WorkPoolConfig {
    pub workers: usize,
    pub policy: SubmissionPolicy,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl WorkPoolConfig {
    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            workers: config.callback_workers.max(1),
            policy: SubmissionPolicy::parse(&config.submission_policy)
                .unwrap_or(SubmissionPolicy::Block),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: millis(config.retry_backoff_ms),
            shutdown_grace: millis(config.shutdown_grace_ms),
        }
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    /// Jobs still queued or in flight when shutdown gave up.
    pub abandoned: AtomicU64,
    /// Jobs accepted and not yet finished.
    pub outstanding: AtomicU64,
}

impl PoolStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Shutdown may already have zeroed the count.
    fn finish_one(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

struct Worker {
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CallbackJob>>>,
    client: Arc<dyn CallbackClient>,
    handler: Option<Arc<dyn CompletionHandler>>,
    stats: Arc<PoolStats>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            let job = { self.rx.lock().await.recv().await };
            let Some(job) = job else {
                break;
            };
            self.deliver(job).await;
            self.stats.finish_one();
        }
        tracing::debug!(worker = self.id, "callback worker stopped");
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }

    async fn deliver(&self, job: CallbackJob) {
        let mut attempt = 1;
        loop {
            match self.client.deliver(&job).await {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task_guid = %job.task_guid, attempt, "callback delivered");
                    if let Some(handler) = &self.handler {
                        handler.on_delivered(&job).await;
                    }
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        task_guid = %job.task_guid,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "callback failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task_guid = %job.task_guid, attempt, error = %e, "callback delivery failed");
                    if let Some(handler) = &self.handler {
                        handler.on_failed(&job, &e).await;
                    }
                    return;
                }
            }
        }
    }
}

/// Fixed set of workers draining a bounded queue.
///
/// The queue holds as many jobs as there are workers.
pub struct CallbackWorkPool {
    tx: Mutex<Option<mpsc::Sender<CallbackJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    policy: SubmissionPolicy,
    shutdown_grace: Duration,
    stats: Arc<PoolStats>,
}

impl CallbackWorkPool {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(
        config: WorkPoolConfig,
        client: Arc<dyn CallbackClient>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let handles = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    rx: rx.clone(),
                    client: client.clone(),
                    handler: handler.clone(),
                    stats: stats.clone(),
                    max_attempts: config.max_attempts.max(1),
                    retry_backoff: config.retry_backoff,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(workers, policy = ?config.policy, "callback work pool started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            policy: config.policy,
            shutdown_grace: config.shutdown_grace,
            stats,
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Queue a job according to the submission policy.
    pub async fn submit(&self, job: CallbackJob) -> BulletinResult<()> {
        let tx = self.tx.lock().clone().ok_or(BulletinError::PoolClosed)?;
        // Counted before the send so a worker never finishes an uncounted job.
        self.stats.outstanding.fetch_add(1, Ordering::AcqRel);
        let result = match self.policy {
            SubmissionPolicy::Block => tx.send(job).await.map_err(|_| BulletinError::PoolClosed),
            SubmissionPolicy::Reject => tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    BulletinError::PoolSaturated
                }
                mpsc::error::TrySendError::Closed(_) => BulletinError::PoolClosed,
            }),
        };
        if result.is_ok() {
            self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.finish_one();
        }
        result
    }

    /// Stop accepting jobs, let workers drain for the grace period, then
    /// abort whatever is left.
    pub async fn shutdown(&self) {
        let queued = self.queued();
        drop(self.tx.lock().take());
        let mut handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        tracing::info!(queued, "draining callback work pool");

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            for handle in &handles {
                handle.abort();
            }
            // Jobs mid-delivery plus those still queued behind them.
            let abandoned = self.stats.outstanding.swap(0, Ordering::AcqRel);
            self.stats.abandoned.fetch_add(abandoned, Ordering::Relaxed);
            tracing::warn!(abandoned, "callback work pool shutdown grace elapsed, abandoning jobs");
        } else {
            tracing::info!("callback work pool drained");
        }
    }
}
