//! In-process hierarchical key-value tree.
//!
//! Paths are `/`-separated. Every mutation advances a tree-wide index; each
//! node remembers the index that created it and the index of its last
//! modification, which is the compare-and-swap token.

use super::kv::{KvError, KvNode};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct TreeEntry {
    value: Vec<u8>,
    created_index: u64,
    modified_index: u64,
}

/// Tree state. Callers serialize access.
#[derive(Debug, Default)]
pub struct KvTree {
    index: u64,
    nodes: BTreeMap<String, TreeEntry>,
}

impl KvTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tree-wide index.
    pub fn index(&self) -> u64 {
        self.index
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn node(path: &str, entry: &TreeEntry) -> KvNode {
        KvNode {
            path: path.to_string(),
            value: entry.value.clone(),
            created_index: entry.created_index,
            modified_index: entry.modified_index,
        }
    }

    pub fn get(&self, path: &str) -> Option<KvNode> {
        self.nodes.get(path).map(|e| Self::node(path, e))
    }

    /// Direct children of a directory path.
    pub fn list(&self, dir: &str) -> Vec<KvNode> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, e)| Self::node(path, e))
            .collect()
    }

    pub fn create(&mut self, path: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.check_absent(path)?;
        let index = self.next_index();
        self.apply_put(path, value, index, index);
        Ok(index)
    }

    /// Fail unless `path` is free.
    pub fn check_absent(&self, path: &str) -> Result<(), KvError> {
        if self.nodes.contains_key(path) {
            return Err(KvError::NodeExists {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// The node at `path`, if its modified index is still `prev_index`.
    pub fn check_current(&self, path: &str, prev_index: u64) -> Result<KvNode, KvError> {
        let node = self.get(path).ok_or_else(|| KvError::KeyNotFound {
            path: path.to_string(),
        })?;
        if node.modified_index != prev_index {
            return Err(KvError::TestFailed {
                path: path.to_string(),
                current: node.modified_index,
            });
        }
        Ok(node)
    }

    /// Index the next mutation will be assigned.
    pub fn peek_index(&self) -> u64 {
        self.index + 1
    }

    pub fn compare_and_swap(
        &mut self,
        path: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, KvError> {
        let node = self.check_current(path, prev_index)?;
        let index = self.next_index();
        self.apply_put(path, value, node.created_index, index);
        Ok(index)
    }

    pub fn compare_and_delete(&mut self, path: &str, prev_index: u64) -> Result<(), KvError> {
        self.check_current(path, prev_index)?;
        let index = self.next_index();
        self.apply_delete(path, index);
        Ok(())
    }

    /// Write a node with known indexes, as recorded in a log.
    pub fn apply_put(&mut self, path: &str, value: Vec<u8>, created_index: u64, modified_index: u64) {
        self.index = self.index.max(modified_index);
        self.nodes.insert(
            path.to_string(),
            TreeEntry {
                value,
                created_index,
                modified_index,
            },
        );
    }

    /// Remove a node at a known index, as recorded in a log.
    pub fn apply_delete(&mut self, path: &str, index: u64) {
        self.index = self.index.max(index);
        self.nodes.remove(path);
    }

    /// Number of nodes under all paths.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_returns_direct_children_only() {
        let mut tree = KvTree::new();
        tree.create("/v1/desired/a", b"1".to_vec()).unwrap();
        tree.create("/v1/desired/b", b"2".to_vec()).unwrap();
        tree.create("/v1/desired/b/nested", b"3".to_vec()).unwrap();
        tree.create("/v1/desiredx/c", b"4".to_vec()).unwrap();

        let paths: Vec<_> = tree.list("/v1/desired").into_iter().map(|n| n.path).collect();
        assert_eq!(paths, vec!["/v1/desired/a", "/v1/desired/b"]);
    }

    #[test]
    fn test_indexes_advance_on_every_mutation() {
        let mut tree = KvTree::new();
        let created = tree.create("/k", vec![1]).unwrap();
        let swapped = tree.compare_and_swap("/k", vec![2], created).unwrap();
        assert!(swapped > created);
        let node = tree.get("/k").unwrap();
        assert_eq!(node.created_index, created);
        assert_eq!(node.modified_index, swapped);

        assert!(matches!(
            tree.compare_and_swap("/k", vec![3], created),
            Err(KvError::TestFailed { current, .. }) if current == swapped
        ));
        tree.compare_and_delete("/k", swapped).unwrap();
        assert!(tree.get("/k").is_none());
        assert!(tree.index() > swapped);
    }

    #[test]
    fn test_applied_entries_advance_the_index() {
        let mut tree = KvTree::new();
        tree.apply_put("/a", vec![1], 3, 7);
        assert_eq!(tree.index(), 7);
        assert_eq!(tree.peek_index(), 8);
        tree.apply_delete("/a", 9);
        assert!(tree.get("/a").is_none());
        assert_eq!(tree.create("/b", vec![2]).unwrap(), 10);
    }
}
