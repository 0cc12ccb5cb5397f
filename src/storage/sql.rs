//! Relational engine on sqlite.
//!
//! Records live in a single table:
//!
//! ```sql
//! records(namespace TEXT, key TEXT, version INTEGER, value BLOB,
//!         PRIMARY KEY (namespace, key))
//! ```
//!
//! Writes are conditional statements (`UPDATE ... WHERE version = ?`), so
//! the database enforces optimistic concurrency. Versions are drawn from a
//! one-row `sequence` table in the same transaction as the write, so a key
//! that is deleted and created again never reuses a version a stale reader
//! might still hold. Connections come from a small checkout pool and every
//! statement runs on the blocking pool.

use super::{Backend, Engine, StoredRecord};
use crate::core::config::RelationalBackendConfig;
use crate::core::error::{BulletinError, BulletinResult};
use crate::models::Namespace;
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS records (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    version INTEGER NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (namespace, key)
);
CREATE TABLE IF NOT EXISTS sequence (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO sequence (id, value)
    SELECT 0, COALESCE(MAX(version), 0) FROM records;";

struct PoolShared {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
}

/// Connection checked out of the pool; returned on drop.
struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
            self.pool.available.notify_one();
        }
    }
}

#[derive(Clone)]
struct SqlPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl SqlPool {
    fn open(connection_string: &str, max_connections: usize) -> rusqlite::Result<Self> {
        let in_memory = connection_string == ":memory:";
        // Each in-memory connection is a separate database.
        let size = if in_memory { 1 } else { max_connections.max(1) };

        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = if in_memory {
                Connection::open_in_memory()?
            } else {
                Connection::open(connection_string)?
            };
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conns.push(conn);
        }
        if let Some(first) = conns.first() {
            first.execute_batch(SCHEMA)?;
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(conns),
                available: Condvar::new(),
            }),
            size,
        })
    }

    /// Block until a connection is idle.
    fn checkout(&self) -> PooledConnection {
        let mut idle = self.shared.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConnection {
                    conn: Some(conn),
                    pool: self.shared.clone(),
                };
            }
            self.shared.available.wait(&mut idle);
        }
    }
}

/// [`Backend`] storing records in a relational table.
#[derive(Clone)]
pub struct SqlEngine {
    pool: SqlPool,
}

fn db_err(e: rusqlite::Error) -> BulletinError {
    BulletinError::backend(format!("sqlite: {e}"))
}

impl SqlEngine {
    /// Open (and create if needed) the database named by the config.
    pub fn open(config: &RelationalBackendConfig) -> BulletinResult<Self> {
        if config.driver != "sqlite" {
            return Err(BulletinError::backend(format!(
                "unsupported driver: {}",
                config.driver
            )));
        }
        let pool = SqlPool::open(&config.connection_string, config.max_connections)
            .map_err(db_err)?;
        tracing::info!(
            connection = %config.connection_string,
            pool_size = pool.size,
            "opened relational backend"
        );
        Ok(Self { pool })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> BulletinResult<Self> {
        let pool = SqlPool::open(":memory:", 1).map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size
    }

    async fn with_conn<T, F>(&self, f: F) -> BulletinResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> BulletinResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.checkout();
            f(&mut *conn)
        })
        .await
        .map_err(|e| BulletinError::backend(format!("blocking task failed: {e}")))?
    }
}

/// Advance the store-wide version counter. Rolled back with `tx`.
fn next_version(tx: &Transaction<'_>) -> BulletinResult<u64> {
    tx.execute("UPDATE sequence SET value = value + 1 WHERE id = 0", [])
        .map_err(db_err)?;
    tx.query_row("SELECT value FROM sequence WHERE id = 0", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|v| v as u64)
    .map_err(db_err)
}

fn write_tx(conn: &mut Connection) -> BulletinResult<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)
}

fn current_version(conn: &Connection, ns: &str, key: &str) -> BulletinResult<Option<u64>> {
    conn.query_row(
        "SELECT version FROM records WHERE namespace = ?1 AND key = ?2",
        params![ns, key],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v as u64))
    .map_err(db_err)
}

#[async_trait]
impl Backend for SqlEngine {
    fn engine(&self) -> Engine {
        Engine::Relational
    }

    async fn get(&self, namespace: Namespace, key: &str) -> BulletinResult<StoredRecord> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, version FROM records WHERE namespace = ?1 AND key = ?2",
                    params![namespace.as_str(), key],
                    |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            match row {
                Some((value, version)) => Ok(StoredRecord {
                    key,
                    value,
                    version: version as u64,
                }),
                None => Err(BulletinError::not_found(namespace.as_str(), key)),
            }
        })
        .await
    }

    async fn get_all(&self, namespace: Namespace) -> BulletinResult<Vec<StoredRecord>> {
        self.with_conn(move |conn| {
            // Single statement: sqlite reads see one consistent snapshot.
            let mut stmt = conn
                .prepare(
                    "SELECT key, value, version FROM records WHERE namespace = ?1 ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![namespace.as_str()], |row| {
                    Ok(StoredRecord {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        version: row.get::<_, i64>(2)? as u64,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn create(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> BulletinResult<u64> {
        if key.is_empty() {
            return Err(BulletinError::invalid("key cannot be blank"));
        }
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let version = next_version(&tx)?;
            let inserted = tx
                .execute(
                    "INSERT INTO records (namespace, key, version, value) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (namespace, key) DO NOTHING",
                    params![namespace.as_str(), key, version as i64, value],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(BulletinError::already_exists(namespace.as_str(), key));
            }
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> BulletinResult<u64> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let version = next_version(&tx)?;
            let updated = tx
                .execute(
                    "UPDATE records SET value = ?1, version = ?2
                     WHERE namespace = ?3 AND key = ?4 AND version = ?5",
                    params![value, version as i64, namespace.as_str(), key, expected as i64],
                )
                .map_err(db_err)?;
            if updated == 1 {
                tx.commit().map_err(db_err)?;
                return Ok(version);
            }
            drop(tx);
            match current_version(conn, namespace.as_str(), &key)? {
                Some(actual) => Err(BulletinError::conflict(
                    namespace.as_str(),
                    key,
                    expected,
                    actual,
                )),
                None => Err(BulletinError::not_found(namespace.as_str(), key)),
            }
        })
        .await
    }

    async fn delete(&self, namespace: Namespace, key: &str, expected: u64) -> BulletinResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM records WHERE namespace = ?1 AND key = ?2 AND version = ?3",
                    params![namespace.as_str(), key, expected as i64],
                )
                .map_err(db_err)?;
            if deleted == 1 {
                return Ok(());
            }
            match current_version(conn, namespace.as_str(), &key)? {
                Some(actual) => Err(BulletinError::conflict(
                    namespace.as_str(),
                    key,
                    expected,
                    actual,
                )),
                None => Err(BulletinError::not_found(namespace.as_str(), key)),
            }
        })
        .await
    }

    async fn count(&self, namespace: Namespace) -> BulletinResult<usize> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM records WHERE namespace = ?1",
                params![namespace.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
        })
        .await
    }
}
