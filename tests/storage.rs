//! Backend engine and record store tests.
//!
//! Behavioral checks run against both engines.

mod common;

use bulletin::core::config::{BackendConfig, RelationalBackendConfig};
use bulletin::core::error::BulletinError;
use bulletin::events::{Category, EventHub, EventKind};
use bulletin::models::{DesiredLrp, Namespace, Task};
use bulletin::storage::wal::WAL_FILE;
use bulletin::storage::{open_backend, Backend, Engine, SqlEngine};
use common::{
    kv_backend, sql_backend, store, store_with_events, wal_backend, wal_backend_in,
};
use std::io::Write;
use std::sync::Arc;

fn engines() -> Vec<(Arc<dyn Backend>, Option<tempfile::TempDir>)> {
    let (sql, sql_dir) = sql_backend();
    let (wal, wal_dir) = wal_backend();
    vec![
        (kv_backend(), None),
        (wal, Some(wal_dir)),
        (sql, Some(sql_dir)),
    ]
}

// ============================================================================
// Backend contract
// ============================================================================

#[tokio::test]
async fn create_get_and_duplicate() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        let version = backend
            .create(Namespace::Desired, "web", b"v1".to_vec())
            .await
            .unwrap();

        let stored = backend.get(Namespace::Desired, "web").await.unwrap();
        assert_eq!(stored.key, "web", "{engine}");
        assert_eq!(stored.value, b"v1".to_vec(), "{engine}");
        assert_eq!(stored.version, version, "{engine}");

        let dup = backend.create(Namespace::Desired, "web", b"v2".to_vec()).await;
        assert!(
            matches!(dup, Err(BulletinError::AlreadyExists { .. })),
            "{engine}: {dup:?}"
        );

        // Namespaces are disjoint.
        assert!(matches!(
            backend.get(Namespace::Actual, "web").await,
            Err(BulletinError::NotFound { .. })
        ));
        backend
            .create(Namespace::Actual, "web", b"other".to_vec())
            .await
            .unwrap();
        assert_eq!(backend.count(Namespace::Desired).await.unwrap(), 1);
        assert_eq!(backend.count(Namespace::Actual).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn compare_and_swap_checks_version() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        let v1 = backend
            .create(Namespace::Task, "t1", b"a".to_vec())
            .await
            .unwrap();
        let v2 = backend
            .compare_and_swap(Namespace::Task, "t1", v1, b"b".to_vec())
            .await
            .unwrap();
        assert!(v2 > v1, "{engine}");

        match backend
            .compare_and_swap(Namespace::Task, "t1", v1, b"c".to_vec())
            .await
        {
            Err(BulletinError::Conflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, v1, "{engine}");
                assert_eq!(actual, v2, "{engine}");
            }
            other => panic!("{engine}: expected Conflict, got {other:?}"),
        }
        assert_eq!(
            backend.get(Namespace::Task, "t1").await.unwrap().value,
            b"b".to_vec()
        );

        assert!(matches!(
            backend
                .compare_and_swap(Namespace::Task, "missing", 1, b"x".to_vec())
                .await,
            Err(BulletinError::NotFound { .. })
        ));
    }
}

#[tokio::test]
async fn delete_checks_version() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        let v1 = backend
            .create(Namespace::Desired, "web", b"a".to_vec())
            .await
            .unwrap();
        let v2 = backend
            .compare_and_swap(Namespace::Desired, "web", v1, b"b".to_vec())
            .await
            .unwrap();

        let stale = backend.delete(Namespace::Desired, "web", v1).await;
        assert!(
            matches!(stale, Err(BulletinError::Conflict { .. })),
            "{engine}: {stale:?}"
        );
        backend.delete(Namespace::Desired, "web", v2).await.unwrap();
        assert!(matches!(
            backend.delete(Namespace::Desired, "web", v2).await,
            Err(BulletinError::NotFound { .. })
        ));
        assert_eq!(backend.count(Namespace::Desired).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn recreated_key_rejects_stale_version() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        let first = backend
            .create(Namespace::Task, "t1", b"first".to_vec())
            .await
            .unwrap();
        backend.delete(Namespace::Task, "t1", first).await.unwrap();
        let second = backend
            .create(Namespace::Task, "t1", b"second".to_vec())
            .await
            .unwrap();
        assert!(second > first, "{engine}: {second} <= {first}");

        let stale = backend
            .compare_and_swap(Namespace::Task, "t1", first, b"stale".to_vec())
            .await;
        assert!(
            matches!(stale, Err(BulletinError::Conflict { .. })),
            "{engine}: {stale:?}"
        );
        let stale = backend.delete(Namespace::Task, "t1", first).await;
        assert!(
            matches!(stale, Err(BulletinError::Conflict { .. })),
            "{engine}: {stale:?}"
        );

        let stored = backend.get(Namespace::Task, "t1").await.unwrap();
        assert_eq!(stored.value, b"second".to_vec(), "{engine}");
        assert_eq!(stored.version, second, "{engine}");
    }
}

#[tokio::test]
async fn concurrent_compare_and_swap_has_one_winner() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        let version = backend
            .create(Namespace::Actual, "web-0", b"start".to_vec())
            .await
            .unwrap();

        let a = backend.clone();
        let b = backend.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move {
                a.compare_and_swap(Namespace::Actual, "web-0", version, b"a".to_vec())
                    .await
            }),
            tokio::spawn(async move {
                b.compare_and_swap(Namespace::Actual, "web-0", version, b"b".to_vec())
                    .await
            }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(BulletinError::Conflict { .. })))
            .count();
        assert_eq!(winners, 1, "{engine}");
        assert_eq!(conflicts, 1, "{engine}");

        let stored = backend.get(Namespace::Actual, "web-0").await.unwrap();
        assert!(stored.value == b"a".to_vec() || stored.value == b"b".to_vec());
    }
}

#[tokio::test]
async fn get_all_is_a_snapshot() {
    for (backend, _dir) in engines() {
        let engine = backend.engine();
        for key in ["c", "a", "b"] {
            backend
                .create(Namespace::Desired, key, key.as_bytes().to_vec())
                .await
                .unwrap();
        }
        let snapshot = backend.get_all(Namespace::Desired).await.unwrap();
        backend
            .create(Namespace::Desired, "d", b"d".to_vec())
            .await
            .unwrap();

        let keys: Vec<_> = snapshot.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"], "{engine}");
        assert_eq!(backend.count(Namespace::Desired).await.unwrap(), 4);
    }
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let kv = kv_backend();
    assert!(matches!(
        kv.create(Namespace::Desired, "a/b", b"x".to_vec()).await,
        Err(BulletinError::InvalidRecord { .. })
    ));
    for (backend, _dir) in engines() {
        assert!(matches!(
            backend.create(Namespace::Desired, "", b"x".to_vec()).await,
            Err(BulletinError::InvalidRecord { .. })
        ));
    }
}

#[tokio::test]
async fn relational_state_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = RelationalBackendConfig {
        driver: "sqlite".to_string(),
        connection_string: dir.path().join("b.db").to_string_lossy().into_owned(),
        max_connections: 2,
    };
    {
        let engine = SqlEngine::open(&config).unwrap();
        assert_eq!(engine.pool_size(), 2);
        engine
            .create(Namespace::Task, "t1", b"persisted".to_vec())
            .await
            .unwrap();
    }
    let engine = SqlEngine::open(&config).unwrap();
    let stored = engine.get(Namespace::Task, "t1").await.unwrap();
    assert_eq!(stored.value, b"persisted".to_vec());
    assert_eq!(stored.version, 1);

    // Versions keep counting across restarts, even past deleted records.
    engine.delete(Namespace::Task, "t1", 1).await.unwrap();
    drop(engine);
    let engine = SqlEngine::open(&config).unwrap();
    let version = engine
        .create(Namespace::Task, "t1", b"again".to_vec())
        .await
        .unwrap();
    assert_eq!(version, 2);
}

#[tokio::test]
async fn kv_log_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let (web, task) = {
        let backend = wal_backend_in(dir.path());
        let web = backend
            .create(Namespace::Desired, "web", b"a".to_vec())
            .await
            .unwrap();
        let web = backend
            .compare_and_swap(Namespace::Desired, "web", web, b"b".to_vec())
            .await
            .unwrap();
        let task = backend
            .create(Namespace::Task, "t1", b"t".to_vec())
            .await
            .unwrap();
        backend.delete(Namespace::Task, "t1", task).await.unwrap();
        (web, task)
    };

    let backend = wal_backend_in(dir.path());
    let stored = backend.get(Namespace::Desired, "web").await.unwrap();
    assert_eq!(stored.value, b"b".to_vec());
    assert_eq!(stored.version, web);
    assert!(matches!(
        backend.get(Namespace::Task, "t1").await,
        Err(BulletinError::NotFound { .. })
    ));

    let recreated = backend
        .create(Namespace::Task, "t1", b"t".to_vec())
        .await
        .unwrap();
    assert!(recreated > task);
    assert!(recreated > web);
}

#[tokio::test]
async fn kv_log_drops_torn_tail() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join(WAL_FILE);
    let version = {
        let backend = wal_backend_in(dir.path());
        backend
            .create(Namespace::Desired, "web", b"a".to_vec())
            .await
            .unwrap()
    };
    let whole_len = std::fs::metadata(&log).unwrap().len();

    // A length prefix promising more bytes than were written.
    let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[64, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(file);

    let backend = wal_backend_in(dir.path());
    assert_eq!(std::fs::metadata(&log).unwrap().len(), whole_len);
    let stored = backend.get(Namespace::Desired, "web").await.unwrap();
    assert_eq!(stored.version, version);

    backend
        .create(Namespace::Desired, "worker", b"w".to_vec())
        .await
        .unwrap();
    drop(backend);
    let backend = wal_backend_in(dir.path());
    assert_eq!(backend.count(Namespace::Desired).await.unwrap(), 2);
}

#[test]
fn relational_in_memory_uses_single_connection() {
    let engine = SqlEngine::in_memory().unwrap();
    assert_eq!(engine.pool_size(), 1);

    let config = RelationalBackendConfig {
        driver: "sqlite".to_string(),
        connection_string: ":memory:".to_string(),
        max_connections: 8,
    };
    assert_eq!(SqlEngine::open(&config).unwrap().pool_size(), 1);

    let unsupported = RelationalBackendConfig {
        driver: "postgres".to_string(),
        ..config
    };
    assert!(SqlEngine::open(&unsupported).is_err());
}

#[test]
fn open_backend_by_engine() {
    let config = BackendConfig::default();
    assert_eq!(open_backend(&config, Engine::Kv).unwrap().engine(), Engine::Kv);
    assert_eq!(
        open_backend(&config, Engine::Relational).unwrap().engine(),
        Engine::Relational
    );
    assert_eq!(Engine::parse("relational"), Some(Engine::Relational));
    assert_eq!(Engine::parse("etcd"), None);
}

#[tokio::test]
async fn open_backend_persists_kv_with_data_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = BackendConfig::default();
    config.kv.data_dir = Some(dir.path().join("kv").to_string_lossy().into_owned());

    let version = {
        let backend = open_backend(&config, Engine::Kv).unwrap();
        backend
            .create(Namespace::Task, "t1", b"kept".to_vec())
            .await
            .unwrap()
    };
    assert!(dir.path().join("kv").join(WAL_FILE).exists());

    let backend = open_backend(&config, Engine::Kv).unwrap();
    let stored = backend.get(Namespace::Task, "t1").await.unwrap();
    assert_eq!(stored.value, b"kept".to_vec());
    assert_eq!(stored.version, version);
}

// ============================================================================
// RecordStore
// ============================================================================

#[tokio::test]
async fn record_store_encrypts_at_rest() {
    for (backend, _dir) in engines() {
        let store = store(backend.clone());
        let desired = DesiredLrp::new("web", "apps", 2, "preloaded:cflinuxfs4");
        let version = store.create(&desired).await.unwrap();

        let raw = backend.get(Namespace::Desired, "web").await.unwrap();
        assert!(!raw
            .value
            .windows(b"cflinuxfs4".len())
            .any(|w| w == b"cflinuxfs4"));

        let read = store.get::<DesiredLrp>("web").await.unwrap();
        assert_eq!(read.record, desired);
        assert_eq!(read.version, version);
    }
}

#[tokio::test]
async fn record_store_validates_before_writing() {
    let backend = kv_backend();
    let store = store(backend.clone());
    let invalid = DesiredLrp::new("web", "", 1, "rootfs");
    assert!(matches!(
        store.create(&invalid).await,
        Err(BulletinError::InvalidRecord { .. })
    ));
    assert_eq!(backend.count(Namespace::Desired).await.unwrap(), 0);
}

#[tokio::test]
async fn record_set_iterates_repeatedly() {
    let store = store(kv_backend());
    for guid in ["a", "b"] {
        store
            .create(&DesiredLrp::new(guid, "apps", 1, "rootfs"))
            .await
            .unwrap();
    }
    let set = store.get_all::<DesiredLrp>().await.unwrap();
    store
        .create(&DesiredLrp::new("c", "apps", 1, "rootfs"))
        .await
        .unwrap();

    assert_eq!(set.len(), 2);
    let first: Vec<_> = set.iter().map(|r| r.unwrap().record.process_guid).collect();
    let second: Vec<_> = set.clone().iter().map(|r| r.unwrap().record.process_guid).collect();
    assert_eq!(first, second);
    assert_eq!(set.keys().collect::<Vec<_>>(), vec!["a", "b"]);
}

#[tokio::test]
async fn record_store_publishes_changes() {
    let hub = Arc::new(EventHub::default());
    let store = store_with_events(kv_backend(), hub.clone());
    let mut desired_events = hub.subscribe(Category::Desired).unwrap();
    let mut actual_events = hub.subscribe(Category::Actual).unwrap();

    let mut desired = DesiredLrp::new("web", "apps", 1, "rootfs");
    let v1 = store.create(&desired).await.unwrap();
    desired.instances = 3;
    let v2 = store.compare_and_swap(v1, &desired).await.unwrap();
    store.delete::<DesiredLrp>("web", v2).await.unwrap();

    let created = desired_events.next().await.unwrap();
    assert_eq!(created.kind, EventKind::Created);
    assert_eq!(created.version, v1);
    assert_eq!(created.payload.unwrap()["instances"], 1);

    let changed = desired_events.next().await.unwrap();
    assert_eq!(changed.kind, EventKind::Changed);
    assert_eq!(changed.version, v2);

    let removed = desired_events.next().await.unwrap();
    assert_eq!(removed.kind, EventKind::Removed);
    assert_eq!(removed.key, "web");
    assert!(removed.payload.is_none());

    // Tasks have no event category.
    store.create(&Task::new("t1", "jobs")).await.unwrap();
    assert!(actual_events.try_next().is_none());
    assert!(desired_events.try_next().is_none());
}

#[tokio::test]
async fn failed_writes_publish_nothing() {
    let hub = Arc::new(EventHub::default());
    let store = store_with_events(kv_backend(), hub.clone());
    let mut events = hub.subscribe(Category::Desired).unwrap();

    let desired = DesiredLrp::new("web", "apps", 1, "rootfs");
    let v1 = store.create(&desired).await.unwrap();
    assert!(store.create(&desired).await.is_err());
    assert!(store.compare_and_swap(v1 + 100, &desired).await.is_err());

    assert_eq!(events.next().await.unwrap().kind, EventKind::Created);
    assert!(events.try_next().is_none());
}
