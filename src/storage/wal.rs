//! Write-ahead log persisting the key-value tree.
//!
//! Every mutation is appended to the log as a length-prefixed bincode entry
//! and synced before it is applied to the in-memory [`KvTree`], so a
//! reported version always survives a restart. Opening a log replays it.
//! A torn entry at the tail (a crash mid-append) is dropped and the file is
//! truncated back to the last whole entry.
//!
//! A log belongs to one process at a time.

use super::kv::{KvClient, KvError, KvNode};
use super::tree::KvTree;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Log file name inside the data directory.
pub const WAL_FILE: &str = "kv.wal";

/// A logged tree mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    Put {
        path: String,
        value: Vec<u8>,
        created_index: u64,
        modified_index: u64,
    },
    Delete {
        path: String,
        index: u64,
    },
}

impl WalEntry {
    fn apply(self, tree: &mut KvTree) {
        match self {
            Self::Put {
                path,
                value,
                created_index,
                modified_index,
            } => tree.apply_put(&path, value, created_index, modified_index),
            Self::Delete { path, index } => tree.apply_delete(&path, index),
        }
    }
}

struct WalState {
    tree: KvTree,
    file: File,
}

/// [`KvClient`] over a [`KvTree`] persisted to a write-ahead log.
pub struct WalKvClient {
    path: PathBuf,
    state: Mutex<WalState>,
}

impl WalKvClient {
    /// Open the log in `dir`, creating both if needed, and replay it.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create kv data dir: {}", dir.display()))?;
        Self::open(&dir.join(WAL_FILE))
    }

    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open kv log: {}", path.display()))?;

        let (tree, entries, valid_len) = replay(&file)?;
        let file_len = file.metadata().context("failed to stat kv log")?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "dropping torn tail of kv log"
            );
            file.set_len(valid_len).context("failed to truncate kv log")?;
        }

        tracing::info!(
            path = %path.display(),
            entries,
            index = tree.index(),
            "opened kv log"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState { tree, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current tree-wide index.
    pub fn index(&self) -> u64 {
        self.state.lock().tree.index()
    }

    fn append(file: &mut File, entry: &WalEntry) -> Result<(), KvError> {
        let unavailable = |message: String| KvError::Unavailable { message };
        let bytes = bincode::serialize(entry)
            .map_err(|e| unavailable(format!("failed to encode kv log entry: {e}")))?;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);
        file.write_all(&frame)
            .and_then(|_| file.sync_data())
            .map_err(|e| unavailable(format!("failed to append kv log: {e}")))
    }

    /// Log `entry`, then apply it.
    fn commit(state: &mut WalState, entry: WalEntry) -> Result<(), KvError> {
        Self::append(&mut state.file, &entry)?;
        entry.apply(&mut state.tree);
        Ok(())
    }
}

/// Rebuild the tree from the whole entries in `file`.
///
/// Returns the tree, the entry count and the byte length of the whole
/// entries.
fn replay(file: &File) -> Result<(KvTree, u64, u64)> {
    let mut reader = BufReader::new(file);
    let mut tree = KvTree::new();
    let mut entries = 0u64;
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("failed to read kv log entry length"),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("failed to read kv log entry"),
        }
        let Ok(entry) = bincode::deserialize::<WalEntry>(&body) else {
            break;
        };
        entry.apply(&mut tree);
        entries += 1;
        valid_len += 4 + len as u64;
    }
    Ok((tree, entries, valid_len))
}

#[async_trait]
impl KvClient for WalKvClient {
    async fn get(&self, path: &str) -> Result<Option<KvNode>, KvError> {
        Ok(self.state.lock().tree.get(path))
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError> {
        Ok(self.state.lock().tree.list(dir))
    }

    async fn create(&self, path: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        state.tree.check_absent(path)?;
        let index = state.tree.peek_index();
        Self::commit(
            &mut state,
            WalEntry::Put {
                path: path.to_string(),
                value,
                created_index: index,
                modified_index: index,
            },
        )?;
        Ok(index)
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        let node = state.tree.check_current(path, prev_index)?;
        let index = state.tree.peek_index();
        Self::commit(
            &mut state,
            WalEntry::Put {
                path: path.to_string(),
                value,
                created_index: node.created_index,
                modified_index: index,
            },
        )?;
        Ok(index)
    }

    async fn compare_and_delete(&self, path: &str, prev_index: u64) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.tree.check_current(path, prev_index)?;
        let index = state.tree.peek_index();
        Self::commit(
            &mut state,
            WalEntry::Delete {
                path: path.to_string(),
                index,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_checks_write_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = WalKvClient::open_dir(dir.path()).unwrap();
        let index = client.create("/v1/task/t1", b"a".to_vec()).await.unwrap();
        assert!(client.create("/v1/task/t1", b"b".to_vec()).await.is_err());
        assert!(client
            .compare_and_swap("/v1/task/t1", b"c".to_vec(), index + 5)
            .await
            .is_err());
        let len = std::fs::metadata(client.path()).unwrap().len();
        drop(client);

        let reopened = WalKvClient::open_dir(dir.path()).unwrap();
        assert_eq!(std::fs::metadata(reopened.path()).unwrap().len(), len);
        assert_eq!(reopened.index(), index);
    }
}
