//! Callback work pool tests.

mod common;

use async_trait::async_trait;
use bulletin::core::config::WorkersConfig;
use bulletin::core::error::BulletinError;
use bulletin::workpool::{
    CallbackClient, CallbackJob, CallbackWorkPool, CompletionHandler, DeliveryError,
    SubmissionPolicy, WorkPoolConfig,
};
use common::{eventually, ScriptedClient};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingHandler {
    delivered: Mutex<Vec<String>>,
    failed: Mutex<Vec<(String, DeliveryError)>>,
}

#[async_trait]
impl CompletionHandler for RecordingHandler {
    async fn on_delivered(&self, job: &CallbackJob) {
        self.delivered.lock().push(job.task_guid.clone());
    }

    async fn on_failed(&self, job: &CallbackJob, error: &DeliveryError) {
        self.failed.lock().push((job.task_guid.clone(), error.clone()));
    }
}

fn config(workers: usize, policy: SubmissionPolicy) -> WorkPoolConfig {
    WorkPoolConfig {
        workers,
        policy,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(1),
    }
}

fn job(guid: &str) -> CallbackJob {
    CallbackJob::new(
        guid,
        format!("http://callbacks.local/{guid}"),
        serde_json::json!({ "task_guid": guid }),
    )
}

fn transient() -> Result<(), DeliveryError> {
    Err(DeliveryError::Transient("503".to_string()))
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn config_from_settings() {
    let settings = WorkersConfig {
        callback_workers: 0,
        submission_policy: "reject".to_string(),
        max_attempts: 0,
        retry_backoff_ms: 250,
        shutdown_grace_ms: 100,
        request_timeout_ms: 1000,
    };
    let config = WorkPoolConfig::from_config(&settings);
    assert_eq!(config.workers, 1);
    assert_eq!(config.policy, SubmissionPolicy::Reject);
    assert_eq!(config.max_attempts, 1);
    assert_eq!(config.retry_backoff, Duration::from_millis(250));
    assert_eq!(SubmissionPolicy::parse("block"), Some(SubmissionPolicy::Block));
    assert_eq!(SubmissionPolicy::parse("drop"), None);
}

#[tokio::test]
async fn delivers_and_notifies_handler() {
    let client = Arc::new(ScriptedClient::new());
    let handler = Arc::new(RecordingHandler::default());
    let pool = CallbackWorkPool::start(
        config(2, SubmissionPolicy::Block),
        client.clone(),
        Some(handler.clone()),
    );

    pool.submit(job("t1")).await.unwrap();
    pool.submit(job("t2")).await.unwrap();
    assert!(eventually(WAIT, || handler.delivered.lock().len() == 2).await);

    let mut delivered = handler.delivered.lock().clone();
    delivered.sort();
    assert_eq!(delivered, vec!["t1", "t2"]);
    assert_eq!(client.call_count(), 2);
    assert_eq!(client.calls()[0].url, format!("http://callbacks.local/{}", client.calls()[0].task_guid));
    assert_eq!(pool.stats().delivered(), 2);
    assert_eq!(pool.stats().submitted.load(Ordering::Relaxed), 2);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let client = Arc::new(ScriptedClient::with_script(vec![transient(), transient(), Ok(())]));
    let handler = Arc::new(RecordingHandler::default());
    let mut settings = config(1, SubmissionPolicy::Block);
    settings.retry_backoff = Duration::from_millis(100);
    let pool = CallbackWorkPool::start(settings, client.clone(), Some(handler.clone()));

    let started = Instant::now();
    pool.submit(job("t1")).await.unwrap();
    assert!(eventually(WAIT, || handler.delivered.lock().len() == 1).await);

    // 100ms after the first failure, 200ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.call_count(), 3);
    assert_eq!(pool.stats().retried.load(Ordering::Relaxed), 2);
    assert!(handler.failed.lock().is_empty());

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_give_up_after_max_attempts() {
    let client = Arc::new(ScriptedClient::with_script(vec![
        transient(),
        transient(),
        transient(),
        transient(),
    ]));
    let handler = Arc::new(RecordingHandler::default());
    let pool = CallbackWorkPool::start(
        config(1, SubmissionPolicy::Block),
        client.clone(),
        Some(handler.clone()),
    );

    pool.submit(job("t1")).await.unwrap();
    assert!(eventually(WAIT, || handler.failed.lock().len() == 1).await);

    assert_eq!(client.call_count(), 3);
    assert!(handler.failed.lock()[0].1.is_transient());
    assert_eq!(pool.stats().failed(), 1);
    assert!(handler.delivered.lock().is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let client = Arc::new(ScriptedClient::with_script(vec![Err(
        DeliveryError::Permanent("404".to_string()),
    )]));
    let handler = Arc::new(RecordingHandler::default());
    let pool = CallbackWorkPool::start(
        config(1, SubmissionPolicy::Block),
        client.clone(),
        Some(handler.clone()),
    );

    pool.submit(job("t1")).await.unwrap();
    assert!(eventually(WAIT, || handler.failed.lock().len() == 1).await);
    assert_eq!(client.call_count(), 1);
    assert_eq!(
        handler.failed.lock()[0],
        ("t1".to_string(), DeliveryError::Permanent("404".to_string()))
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn reject_policy_reports_saturation() {
    let client = Arc::new(ScriptedClient::slow(Duration::from_millis(200)));
    let pool = CallbackWorkPool::start(config(1, SubmissionPolicy::Reject), client.clone(), None);

    pool.submit(job("in-flight")).await.unwrap();
    assert!(eventually(WAIT, || client.call_count() == 1).await);

    // One worker busy, one queue slot.
    pool.submit(job("queued")).await.unwrap();
    assert_eq!(pool.queued(), 1);
    assert!(matches!(
        pool.submit(job("rejected")).await,
        Err(BulletinError::PoolSaturated)
    ));
    assert_eq!(pool.stats().rejected.load(Ordering::Relaxed), 1);

    pool.shutdown().await;
    assert_eq!(pool.stats().delivered(), 2);
}

#[tokio::test]
async fn block_policy_waits_for_space() {
    let client = Arc::new(ScriptedClient::slow(Duration::from_millis(20)));
    let pool = CallbackWorkPool::start(config(1, SubmissionPolicy::Block), client.clone(), None);

    for i in 0..5 {
        pool.submit(job(&format!("t{i}"))).await.unwrap();
    }
    assert!(eventually(WAIT, || pool.stats().delivered() == 5).await);
    assert_eq!(pool.stats().rejected.load(Ordering::Relaxed), 0);

    pool.shutdown().await;
}

struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl CallbackClient for ConcurrencyGauge {
    async fn deliver(&self, _job: &CallbackJob) -> Result<(), DeliveryError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn concurrency_is_bounded_by_worker_count() {
    let gauge = Arc::new(ConcurrencyGauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let pool = CallbackWorkPool::start(config(3, SubmissionPolicy::Block), gauge.clone(), None);

    for i in 0..12 {
        pool.submit(job(&format!("t{i}"))).await.unwrap();
    }
    assert!(eventually(WAIT, || pool.stats().delivered() == 12).await);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_queued_jobs() {
    let client = Arc::new(ScriptedClient::slow(Duration::from_millis(20)));
    let pool = CallbackWorkPool::start(config(2, SubmissionPolicy::Block), client.clone(), None);

    for i in 0..4 {
        pool.submit(job(&format!("t{i}"))).await.unwrap();
    }
    pool.shutdown().await;

    assert_eq!(pool.stats().delivered(), 4);
    assert_eq!(pool.stats().abandoned.load(Ordering::Relaxed), 0);
    assert!(matches!(
        pool.submit(job("late")).await,
        Err(BulletinError::PoolClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_work_after_grace() {
    let client = Arc::new(ScriptedClient::slow(Duration::from_secs(60)));
    let mut settings = config(1, SubmissionPolicy::Block);
    settings.shutdown_grace = Duration::from_millis(100);
    let pool = CallbackWorkPool::start(settings, client.clone(), None);

    pool.submit(job("stuck")).await.unwrap();
    assert!(eventually(WAIT, || client.call_count() == 1).await);

    let started = Instant::now();
    pool.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.stats().abandoned.load(Ordering::Relaxed), 1);
    assert_eq!(pool.stats().delivered(), 0);

    // Shutdown is idempotent.
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_count_includes_queued_jobs() {
    let client = Arc::new(ScriptedClient::slow(Duration::from_secs(60)));
    let mut settings = config(1, SubmissionPolicy::Block);
    settings.shutdown_grace = Duration::from_millis(100);
    let pool = CallbackWorkPool::start(settings, client.clone(), None);

    pool.submit(job("stuck")).await.unwrap();
    assert!(eventually(WAIT, || client.call_count() == 1).await);
    pool.submit(job("waiting")).await.unwrap();
    assert_eq!(pool.queued(), 1);

    pool.shutdown().await;
    assert_eq!(pool.stats().abandoned(), 2);
    assert_eq!(client.call_count(), 1);
}
