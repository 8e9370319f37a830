//! The LSM tree: a range-partitioned forest of nodes.
//!
//! Nodes own disjoint, contiguous key ranges; the map below is keyed by
//! each node's first key, so routing a key is one floor lookup. A new
//! index starts with a single node owning the whole keyspace; splits
//! install successor nodes under the same lock that routes writes, so
//! no statement can land in a retired node.

pub mod compact;
pub mod node;
pub mod planner;
pub mod recovery;

pub use node::Node;
pub use planner::{Planner, Task, TaskKind};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use crate::config::IndexConfig;
use crate::disk::DROP_MARKER;
use crate::document::{Document, Scheme, Sequence};
use crate::error::Result;
use crate::iterator::{MergeIterator, ReadIterator};
use crate::memindex::Order;
use crate::quota::Quota;
use crate::vfs::Vfs;

pub struct LsmTree {
    config: IndexConfig,
    dir: PathBuf,
    vfs: Arc<dyn Vfs>,
    scheme: Scheme,
    seq: Arc<Sequence>,
    quota: Arc<Quota>,
    nodes: RwLock<BTreeMap<Vec<u8>, Arc<Node>>>,
    /// Superseded branches awaiting unlink. Kept until no cursor holds
    /// a reference, then renamed to `.gc` and removed.
    garbage: Mutex<Vec<Arc<crate::disk::Branch>>>,
}

impl LsmTree {
    /// Create a fresh index directory with one node owning the whole
    /// keyspace.
    pub fn create(
        vfs: Arc<dyn Vfs>,
        root: &Path,
        config: IndexConfig,
        scheme: Scheme,
        seq: Arc<Sequence>,
        quota: Arc<Quota>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let dir = root.join(&config.name);
        vfs.mkdir_all(&dir)?;
        let root_node = Node::new(seq.next_node_id(), Vec::new(), &quota);
        info!(index = %config.name, "created index");
        Ok(Self::assemble(vfs, dir, config, scheme, seq, quota, vec![root_node]))
    }

    /// Assemble a tree from recovered or fresh nodes. The first node's
    /// range is widened to cover the bottom of the keyspace.
    pub(crate) fn assemble(
        vfs: Arc<dyn Vfs>,
        dir: PathBuf,
        config: IndexConfig,
        scheme: Scheme,
        seq: Arc<Sequence>,
        quota: Arc<Quota>,
        nodes: Vec<Arc<Node>>,
    ) -> Arc<Self> {
        debug_assert!(!nodes.is_empty());
        let mut map = BTreeMap::new();
        for (i, node) in nodes.into_iter().enumerate() {
            let first_key = if i == 0 {
                Vec::new()
            } else {
                node.first_key().to_vec()
            };
            map.insert(first_key, node);
        }
        Arc::new(Self {
            config,
            dir,
            vfs,
            scheme,
            seq,
            quota,
            nodes: RwLock::new(map),
            garbage: Mutex::new(Vec::new()),
        })
    }

    /// Queue superseded branches for deletion by a later gc task.
    pub(crate) fn defer_gc(&self, branches: Vec<Arc<crate::disk::Branch>>) {
        self.garbage.lock().unwrap().extend(branches);
    }

    /// Branches safe to delete: nothing but the queue references them.
    pub(crate) fn take_collectable(&self) -> Vec<Arc<crate::disk::Branch>> {
        let mut garbage = self.garbage.lock().unwrap();
        let (free, held): (Vec<_>, Vec<_>) = garbage
            .drain(..)
            .partition(|b| Arc::strong_count(b) == 1);
        *garbage = held;
        free
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.seq
    }

    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    /// The node owning `key`: the last node whose first key is <= key.
    pub fn node_for(&self, key: &[u8]) -> Arc<Node> {
        let nodes = self.nodes.read().unwrap();
        let (_, node) = nodes
            .range(..=key.to_vec())
            .next_back()
            .expect("tree always has a bottom node");
        Arc::clone(node)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Route a document to its node. A write that races a split lands
    /// on a retired node and is re-routed to the successor.
    pub fn set(&self, doc: Arc<Document>) -> Result<()> {
        loop {
            let node = self.node_for(doc.key());
            if node.set(Arc::clone(&doc))? {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    pub fn get(&self, key: &[u8], vlsn: u64) -> Result<Option<Arc<Document>>> {
        self.node_for(key)
            .get(self.vfs.as_ref(), key, vlsn, &self.scheme.upsert)
    }

    /// Ordered scan of the whole tree at read view `vlsn`. Tombstoned
    /// keys are skipped; upsert chains are folded.
    pub fn cursor(&self, order: Order, from: Option<Vec<u8>>, vlsn: u64) -> TreeCursor {
        let mut nodes: Vec<Arc<Node>> = {
            let map = self.nodes.read().unwrap();
            match (&from, order) {
                // Nodes at or after the one owning `from`.
                (Some(key), Order::Asc) => {
                    let start = self.node_for(key);
                    map.values()
                        .skip_while(|n| n.id() != start.id())
                        .cloned()
                        .collect()
                }
                // Nodes at or before the one owning `from`.
                (Some(key), Order::Desc) => {
                    let stop = self.node_for(key);
                    map.values()
                        .take_while(|n| n.first_key() <= key.as_slice() || n.id() == stop.id())
                        .cloned()
                        .collect()
                }
                _ => map.values().cloned().collect(),
            }
        };
        if order == Order::Desc {
            nodes.reverse();
        }
        TreeCursor {
            vfs: Arc::clone(&self.vfs),
            upsert: Arc::clone(&self.scheme.upsert),
            order,
            from,
            vlsn,
            nodes,
            current: None,
        }
    }

    /// Replace a split node with its successors under the routing lock.
    pub(crate) fn install_split(&self, old: &Node, successors: Vec<Arc<Node>>) {
        let mut map = self.nodes.write().unwrap();
        let old_key = map
            .iter()
            .find(|(_, n)| n.id() == old.id())
            .map(|(k, _)| k.clone());
        if let Some(old_key) = old_key {
            map.remove(&old_key);
            for (i, node) in successors.into_iter().enumerate() {
                // The first successor inherits the retired node's lower
                // bound so the keyspace stays gapless.
                let key = if i == 0 {
                    old_key.clone()
                } else {
                    node.first_key().to_vec()
                };
                map.insert(key, node);
            }
        }
    }

    pub fn mem_bytes(&self) -> usize {
        self.nodes().iter().map(|n| n.mem_bytes()).sum()
    }

    /// Condemn the index: a marker file makes the drop survive a crash.
    pub fn mark_dropped(&self) -> Result<()> {
        let marker = self.dir.join(DROP_MARKER);
        self.vfs.write_all(&marker, &[])?;
        self.vfs.sync(&marker)?;
        self.vfs.sync_dir(&self.dir)
    }

    /// Delete every file of the index. Caller has already detached the
    /// tree from the engine.
    pub fn purge(&self) -> Result<()> {
        for name in self.vfs.read_dir(&self.dir)? {
            self.vfs.unlink(&self.dir.join(name))?;
        }
        info!(index = %self.config.name, "purged index");
        Ok(())
    }
}

/// Concatenates per-node read iterators; node ranges are disjoint and
/// ordered, so no cross-node merge is needed.
pub struct TreeCursor {
    vfs: Arc<dyn Vfs>,
    upsert: crate::document::UpsertFn,
    order: Order,
    from: Option<Vec<u8>>,
    vlsn: u64,
    nodes: Vec<Arc<Node>>,
    current: Option<ReadIterator>,
}

impl TreeCursor {
    fn open_next_node(&mut self) -> Result<bool> {
        if self.nodes.is_empty() {
            return Ok(false);
        }
        let node = self.nodes.remove(0);
        let sources = node.sources(&self.vfs, self.order, self.from.as_deref());
        let merge = MergeIterator::new(sources, self.order)?;
        self.current = Some(ReadIterator::new(
            merge,
            self.vlsn,
            false,
            Arc::clone(&self.upsert),
        ));
        Ok(true)
    }
}

impl Iterator for TreeCursor {
    type Item = Result<Arc<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(Ok(stmt)) => return Some(Ok(stmt.to_document())),
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
            }
            match self.open_next_node() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    fn tree() -> Arc<LsmTree> {
        let vfs: Arc<dyn Vfs> = Arc::new(MemFs::new());
        LsmTree::create(
            vfs,
            Path::new("/db"),
            IndexConfig::new("primary"),
            Scheme::replacing(),
            Arc::new(Sequence::new()),
            Arc::new(Quota::new(16 * 1024 * 1024)),
        )
        .expect("Tree creation failed")
    }

    fn doc(key: &str, value: &str, lsn: u64) -> Arc<Document> {
        Document::new(key.into(), value.into(), lsn, 0)
    }

    #[test]
    fn test_set_get() {
        let tree = tree();
        tree.set(doc("k", "v1", 1)).unwrap();
        tree.set(doc("k", "v2", 2)).unwrap();

        assert_eq!(tree.get(b"k", u64::MAX).unwrap().unwrap().value(), b"v2");
        assert_eq!(tree.get(b"k", 1).unwrap().unwrap().value(), b"v1");
        assert!(tree.get(b"absent", u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_cursor_visibility_and_order() {
        let tree = tree();
        for (key, lsn) in [("b", 1), ("a", 2), ("c", 3), ("d", 4)] {
            tree.set(doc(key, "v", lsn as u64)).unwrap();
        }
        tree.set(Document::tombstone(b"c".to_vec(), 5)).unwrap();

        let asc: Vec<Vec<u8>> = tree
            .cursor(Order::Asc, None, u64::MAX)
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(asc, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);

        // At a read view before the delete, "c" is still there.
        let snapshot: Vec<Vec<u8>> = tree
            .cursor(Order::Asc, None, 4)
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(
            snapshot,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        let desc: Vec<Vec<u8>> = tree
            .cursor(Order::Desc, Some(b"b".to_vec()), u64::MAX)
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(desc, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_node_routing_after_split_install() {
        let tree = tree();
        let old = tree.node_for(b"anything");
        let quota = Arc::clone(tree.quota());
        let left = Node::new(10, Vec::new(), &quota);
        let right = Node::new(11, b"m".to_vec(), &quota);
        tree.install_split(&old, vec![left, right]);

        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.node_for(b"a").id(), 10);
        assert_eq!(tree.node_for(b"m").id(), 11);
        assert_eq!(tree.node_for(b"z").id(), 11);
    }

    #[test]
    fn test_cursor_spans_nodes() {
        let tree = tree();
        let old = tree.node_for(b"");
        let quota = Arc::clone(tree.quota());
        tree.install_split(
            &old,
            vec![
                Node::new(10, Vec::new(), &quota),
                Node::new(11, b"m".to_vec(), &quota),
            ],
        );
        for (key, lsn) in [("a", 1), ("z", 2), ("n", 3), ("b", 4)] {
            tree.set(doc(key, "v", lsn as u64)).unwrap();
        }

        let keys: Vec<Vec<u8>> = tree
            .cursor(Order::Asc, None, u64::MAX)
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"n".to_vec(), b"z".to_vec()]
        );

        let from_n: Vec<Vec<u8>> = tree
            .cursor(Order::Asc, Some(b"n".to_vec()), u64::MAX)
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(from_n, vec![b"n".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_mark_dropped_writes_marker() {
        let tree = tree();
        tree.mark_dropped().unwrap();
        assert!(tree.vfs().exists(&tree.dir().join(DROP_MARKER)));
    }
}
