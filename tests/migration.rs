//! Migration manager tests.

mod common;

use async_trait::async_trait;
use bulletin::core::error::{BulletinError, BulletinResult};
use bulletin::crypto::{Format, RecordCodec};
use bulletin::lock::LockState;
use bulletin::migration::{
    builtin_migrations, Migration, MigrationContext, MigrationManager, MigrationState,
    VersionRecord,
};
use bulletin::models::{DesiredLrp, Namespace, Task};
use bulletin::storage::meta::{self, VERSION_KEY};
use bulletin::storage::{Backend, RecordStore};
use common::{codec, kv_backend, sql_backend, store};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Recording {
    version: u64,
    log: Arc<Mutex<Vec<u64>>>,
    fail: bool,
}

#[async_trait]
impl Migration for Recording {
    fn version(&self) -> u64 {
        self.version
    }

    fn name(&self) -> &str {
        "recording"
    }

    async fn up(&self, _ctx: &MigrationContext) -> BulletinResult<()> {
        if self.fail {
            return Err(BulletinError::backend("simulated failure"));
        }
        self.log.lock().push(self.version);
        Ok(())
    }
}

fn registry(versions: &[u64], log: &Arc<Mutex<Vec<u64>>>) -> Vec<Arc<dyn Migration>> {
    versions
        .iter()
        .map(|&version| {
            Arc::new(Recording {
                version,
                log: log.clone(),
                fail: false,
            }) as Arc<dyn Migration>
        })
        .collect()
}

/// A lock that is already held; the manager never waits on it.
fn held() -> watch::Receiver<LockState> {
    watch::channel(LockState::Held).1
}

fn manager(
    backend: Arc<dyn Backend>,
    migrations: Vec<Arc<dyn Migration>>,
    lock: watch::Receiver<LockState>,
) -> MigrationManager {
    MigrationManager::new(
        MigrationContext::new(backend, codec("new")),
        migrations,
        lock,
        Duration::from_millis(10),
    )
    .unwrap()
}

async fn seed_version(backend: &Arc<dyn Backend>, current: u64) {
    meta::write_meta(
        &**backend,
        VERSION_KEY,
        None,
        &VersionRecord {
            current_version: current,
            target_version: current,
        },
    )
    .await
    .unwrap();
}

async fn stored_version(backend: &Arc<dyn Backend>) -> VersionRecord {
    meta::read_meta::<VersionRecord>(&**backend, VERSION_KEY)
        .await
        .unwrap()
        .unwrap()
        .record
}

async fn seed_record(backend: &Arc<dyn Backend>) {
    store(backend.clone())
        .create(&DesiredLrp::new("web", "apps", 1, "rootfs"))
        .await
        .unwrap();
}

#[tokio::test]
async fn applies_pending_migrations_in_order() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager(backend.clone(), registry(&[5, 2, 3, 1], &log), held());
    assert_eq!(manager.target_version(), 5);
    let (_tx, shutdown) = watch::channel(false);
    manager.run(shutdown.clone()).await.unwrap();

    assert_eq!(*log.lock(), vec![2, 3, 5]);
    assert_eq!(manager.state(), MigrationState::Complete);
    assert!(manager.readiness().is_ready());
    assert_eq!(
        stored_version(&backend).await,
        VersionRecord {
            current_version: 5,
            target_version: 5
        }
    );

    // A second manager over the same store has nothing left to do.
    let again = self::manager(backend.clone(), registry(&[2, 3, 5], &log), held());
    again.run(shutdown).await.unwrap();
    assert_eq!(*log.lock(), vec![2, 3, 5]);
    assert!(again.readiness().is_ready());
}

#[tokio::test]
async fn fresh_store_skips_migrations() {
    let backend = kv_backend();
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager(backend.clone(), registry(&[1, 2], &log), held());
    let (_tx, shutdown) = watch::channel(false);
    manager.run(shutdown).await.unwrap();

    assert!(log.lock().is_empty());
    assert_eq!(stored_version(&backend).await.current_version, 2);
}

#[tokio::test]
async fn unversioned_store_with_records_runs_everything() {
    let backend = kv_backend();
    seed_record(&backend).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager(backend.clone(), registry(&[1, 2], &log), held());
    let (_tx, shutdown) = watch::channel(false);
    manager.run(shutdown).await.unwrap();

    assert_eq!(*log.lock(), vec![1, 2]);
    assert_eq!(stored_version(&backend).await.current_version, 2);
}

#[tokio::test]
async fn newer_stored_version_is_fatal() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 9).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager(backend.clone(), registry(&[1, 2], &log), held());
    let mut readiness = manager.readiness();
    let (_tx, shutdown) = watch::channel(false);

    let result = manager.run(shutdown).await;
    assert!(matches!(
        result,
        Err(BulletinError::MigrationFatal { version: 9, .. })
    ));
    assert!(matches!(manager.state(), MigrationState::Fatal(_)));
    assert!(readiness.wait().await.is_err());
    assert!(log.lock().is_empty());
    assert_eq!(stored_version(&backend).await.current_version, 9);
}

#[tokio::test]
async fn failed_migration_stops_the_pipeline() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut migrations = registry(&[2, 4], &log);
    migrations.push(Arc::new(Recording {
        version: 3,
        log: log.clone(),
        fail: true,
    }));
    let manager = manager(backend.clone(), migrations, held());
    let (_tx, shutdown) = watch::channel(false);

    let result = manager.run(shutdown).await;
    assert!(matches!(
        result,
        Err(BulletinError::MigrationFatal { version: 3, .. })
    ));
    assert_eq!(*log.lock(), vec![2]);
    let stored = stored_version(&backend).await;
    assert_eq!(stored.current_version, 2);
    assert_eq!(stored.target_version, 4);
}

/// Loses the lock while it runs, then reports success.
struct LosesLock {
    version: u64,
    lock: Arc<watch::Sender<LockState>>,
}

#[async_trait]
impl Migration for LosesLock {
    fn version(&self) -> u64 {
        self.version
    }

    fn name(&self) -> &str {
        "loses-lock"
    }

    async fn up(&self, _ctx: &MigrationContext) -> BulletinResult<()> {
        self.lock.send_replace(LockState::Lost);
        Ok(())
    }
}

#[tokio::test]
async fn lock_lost_mid_pipeline_stops_writes() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (lock_tx, lock_rx) = watch::channel(LockState::Held);
    let mut migrations = registry(&[3], &log);
    migrations.push(Arc::new(LosesLock {
        version: 2,
        lock: Arc::new(lock_tx),
    }));
    let manager = manager(backend.clone(), migrations, lock_rx);
    let (_tx, shutdown) = watch::channel(false);

    let result = manager.run(shutdown).await;
    assert!(
        matches!(result, Err(BulletinError::MigrationFatal { version: 2, .. })),
        "{result:?}"
    );
    assert!(matches!(manager.state(), MigrationState::Fatal(_)));
    // Neither version 2 nor the later migration was recorded.
    assert!(log.lock().is_empty());
    let stored = stored_version(&backend).await;
    assert_eq!(stored.current_version, 1);
    assert_eq!(stored.target_version, 3);
}

#[test]
fn duplicate_and_zero_versions_are_rejected() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let ctx = MigrationContext::new(kv_backend(), codec("new"));
    assert!(MigrationManager::new(
        ctx.clone(),
        registry(&[1, 2, 2], &log),
        held(),
        Duration::from_millis(10)
    )
    .is_err());
    assert!(MigrationManager::new(ctx, registry(&[0, 1], &log), held(), Duration::from_millis(10)).is_err());
}

#[tokio::test]
async fn non_holder_waits_for_holder_to_finish() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (_lock_tx, lock_rx) = watch::channel(LockState::Acquiring);
    let follower = Arc::new(manager(backend.clone(), registry(&[1, 2], &log), lock_rx));
    let mut readiness = follower.readiness();

    let (_tx, shutdown) = watch::channel(false);
    let task = {
        let follower = follower.clone();
        tokio::spawn(async move { follower.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!readiness.is_ready());

    // The lock holder finishes elsewhere.
    let current = meta::read_meta::<VersionRecord>(&*backend, VERSION_KEY)
        .await
        .unwrap()
        .unwrap();
    meta::write_meta(
        &*backend,
        VERSION_KEY,
        Some(current.version),
        &VersionRecord {
            current_version: 2,
            target_version: 2,
        },
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), readiness.wait())
        .await
        .unwrap()
        .unwrap();
    task.await.unwrap().unwrap();
    // The follower never ran anything itself.
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn migrates_once_lock_is_acquired() {
    let backend = kv_backend();
    seed_record(&backend).await;
    seed_version(&backend, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (lock_tx, lock_rx) = watch::channel(LockState::Acquiring);
    let manager = Arc::new(manager(backend.clone(), registry(&[1, 2], &log), lock_rx));
    let (_tx, shutdown) = watch::channel(false);
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.state(), MigrationState::Pending);

    lock_tx.send(LockState::Held).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(*log.lock(), vec![2]);
    assert_eq!(manager.state(), MigrationState::Complete);
}

#[tokio::test]
async fn shutdown_while_waiting_leaves_pending() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (_lock_tx, lock_rx) = watch::channel(LockState::Acquiring);
    let backend = kv_backend();
    seed_record(&backend).await;
    let manager = Arc::new(manager(backend, registry(&[1], &log), lock_rx));

    let (tx, shutdown) = watch::channel(false);
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(manager.state(), MigrationState::Pending);
}

// ============================================================================
// Built-in migrations
// ============================================================================

#[tokio::test]
async fn builtin_encrypts_plaintext_records() {
    let backend = kv_backend();
    for guid in ["a", "b"] {
        let plain = RecordCodec::encode_plain(&DesiredLrp::new(guid, "apps", 1, "rootfs")).unwrap();
        backend.create(Namespace::Desired, guid, plain).await.unwrap();
    }
    // Bare JSON written by the oldest releases.
    let bare = serde_json::to_vec(&Task::new("t1", "jobs")).unwrap();
    backend.create(Namespace::Task, "t1", bare).await.unwrap();

    let manager = manager(backend.clone(), builtin_migrations(), held());
    let (_tx, shutdown) = watch::channel(false);
    manager.run(shutdown).await.unwrap();

    for namespace in [Namespace::Desired, Namespace::Task] {
        for stored in backend.get_all(namespace).await.unwrap() {
            let inspected = RecordCodec::inspect(&stored.value).unwrap();
            assert_eq!(inspected.format(), Format::Encrypted);
            assert_eq!(inspected.key_label(), Some("new"));
        }
    }
    let store = store(backend.clone());
    assert_eq!(store.get::<Task>("t1").await.unwrap().record.domain, "jobs");
    assert_eq!(stored_version(&backend).await.current_version, 2);
}

#[tokio::test]
async fn builtin_copies_legacy_engine() {
    let (legacy, _dir) = sql_backend();
    let old_store = RecordStore::new(legacy.clone(), codec("old"));
    for guid in ["a", "b", "c"] {
        old_store
            .create(&DesiredLrp::new(guid, "apps", 2, "rootfs"))
            .await
            .unwrap();
    }
    old_store.create(&Task::new("t1", "jobs")).await.unwrap();

    let active = kv_backend();
    // A partial copy from an interrupted earlier run.
    let partial = legacy.get(Namespace::Desired, "a").await.unwrap();
    active
        .create(Namespace::Desired, "a", partial.value)
        .await
        .unwrap();

    let manager = MigrationManager::new(
        MigrationContext::new(active.clone(), codec("new")).with_legacy(legacy.clone()),
        builtin_migrations(),
        held(),
        Duration::from_millis(10),
    )
    .unwrap();
    let (_tx, shutdown) = watch::channel(false);
    manager.run(shutdown).await.unwrap();

    let store = store(active.clone());
    let desired = store.get_all::<DesiredLrp>().await.unwrap();
    assert_eq!(desired.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    for stored in active.get_all(Namespace::Desired).await.unwrap() {
        assert!(codec("new").is_current(&stored.value).unwrap());
    }
    assert_eq!(store.get::<Task>("t1").await.unwrap().record.task_guid, "t1");
    // The legacy engine is left untouched.
    assert_eq!(legacy.count(Namespace::Desired).await.unwrap(), 3);
}
