//! The embedding surface: `Engine` owns the shared quota, counters,
//! transaction manager and background workers; `Index` is a handle to
//! one recovered tree; `Transaction` buffers writes across any number
//! of indexes and lands them through the tree on commit.
//!
//! Transaction conflict slots live in one manager shared by all
//! indexes, so slot keys are namespaced as `<index name> 0x00 <key>`.
//! Index names therefore reject interior NUL bytes at validation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::config::{EngineConfig, IndexConfig};
use crate::document::{DocFlags, Document, NullWal, Scheme, Sequence, WalSink};
use crate::error::{Error, Result};
use crate::memindex::Order;
use crate::quota::Quota;
use crate::scheduler::{Scheduler, WorkerPool};
use crate::tree::{compact, recovery, LsmTree, TreeCursor};
use crate::tx::{Tx, TxManager, TxStatus};
use crate::vfs::{DiskFs, Vfs};

struct Shared {
    config: EngineConfig,
    vfs: Arc<dyn Vfs>,
    quota: Arc<Quota>,
    seq: Arc<Sequence>,
    tx: Arc<TxManager>,
    wal: Box<dyn WalSink>,
    indexes: Mutex<HashMap<String, Arc<LsmTree>>>,
    scheduler: Arc<Scheduler>,
    workers: Mutex<Option<WorkerPool>>,
}

pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Engine> {
        Self::open_with_wal(config, Box::new(NullWal))
    }

    /// Open with a durability sink; the engine hands every committing
    /// batch to it and assumes durability on `Ok`.
    pub fn open_with_wal(config: EngineConfig, wal: Box<dyn WalSink>) -> Result<Engine> {
        let vfs: Arc<dyn Vfs> = Arc::new(DiskFs);
        vfs.mkdir_all(&config.dir)?;

        let quota = Arc::new(Quota::new(config.memory_limit));
        let seq = Arc::new(Sequence::new());
        let tx = Arc::new(TxManager::new(Arc::clone(&seq)));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&quota),
        ));
        let workers = WorkerPool::spawn(config.workers, Arc::clone(&scheduler), Arc::clone(&tx))?;
        info!(dir = %config.dir.display(), workers = config.workers, "engine open");

        Ok(Engine {
            shared: Arc::new(Shared {
                config,
                vfs,
                quota,
                seq,
                tx,
                wal,
                indexes: Mutex::new(HashMap::new()),
                scheduler,
                workers: Mutex::new(Some(workers)),
            }),
        })
    }

    /// Create or open an index. Opening an existing directory recovers
    /// whatever state the last shutdown or crash left behind.
    pub fn index(&self, config: IndexConfig, scheme: Scheme) -> Result<Index> {
        if config.name.as_bytes().contains(&0) {
            return Err(Error::Config(format!(
                "index name {:?} contains a NUL byte",
                config.name
            )));
        }
        let mut indexes = self.shared.indexes.lock().unwrap();
        let tree = match indexes.get(&config.name) {
            Some(tree) => Arc::clone(tree),
            None => {
                let tree = recovery::open(
                    Arc::clone(&self.shared.vfs),
                    &self.shared.config.dir,
                    config,
                    scheme,
                    Arc::clone(&self.shared.seq),
                    Arc::clone(&self.shared.quota),
                )?;
                indexes.insert(tree.name().to_string(), Arc::clone(&tree));
                self.shared.scheduler.register(Arc::clone(&tree));
                tree
            }
        };
        Ok(Index {
            tree,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn begin(&self) -> Transaction {
        Transaction {
            tx: self.shared.tx.begin(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn live_transactions(&self) -> usize {
        self.shared.tx.live_count()
    }

    pub fn memory_used(&self) -> usize {
        self.shared.quota.used()
    }

    /// Stop the workers, flush every dirty generation, release the
    /// quota. Idempotent; also runs on drop.
    pub fn close(&self) -> Result<()> {
        let Some(workers) = self.shared.workers.lock().unwrap().take() else {
            return Ok(());
        };
        // Workers drain pending drops on their way out.
        self.shared.scheduler.shutdown();
        workers.join();
        let snapshots = self.shared.tx.live_snapshots();
        let indexes = self.shared.indexes.lock().unwrap();
        for tree in indexes.values() {
            for node in tree.nodes() {
                compact::flush(tree, &node, &snapshots)?;
            }
            compact::collect_garbage(tree)?;
        }
        self.shared.quota.close();
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "close on drop failed");
        }
    }
}

/// Handle to one open index. Cheap to clone through `Engine::index`;
/// all handles share the same tree.
pub struct Index {
    tree: Arc<LsmTree>,
    shared: Arc<Shared>,
}

impl Index {
    pub fn name(&self) -> &str {
        self.tree.name()
    }

    /// Non-transactional point read at the current LSN.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let doc = self.tree.get(key, self.shared.seq.current_lsn())?;
        Ok(doc.map(|d| d.value().to_vec()))
    }

    /// Ordered scan. With a transaction the scan runs at its read view
    /// and overlays its uncommitted writes; without one it runs at the
    /// current LSN.
    pub fn range(&self, order: Order, from: Option<Vec<u8>>, tx: Option<&Transaction>) -> Cursor {
        let vlsn = tx.map_or_else(|| self.shared.seq.current_lsn(), |t| t.vlsn());
        let overlay = tx.map_or_else(Vec::new, |t| t.overlay_for(self.name(), order, &from));
        Cursor {
            inner: self.tree.cursor(order, from, vlsn),
            tree_head: None,
            overlay: overlay.into_iter().peekable(),
            order,
            upsert: Arc::clone(&self.tree.scheme().upsert),
        }
    }

    /// Condemn the index. The marker file makes the drop survive a
    /// crash; a background worker deletes the files.
    pub fn drop_index(self) -> Result<()> {
        self.tree.mark_dropped()?;
        self.shared
            .indexes
            .lock()
            .unwrap()
            .remove(self.tree.name());
        self.shared.scheduler.queue_drop(self.tree.name());
        info!(index = %self.tree.name(), "index condemned");
        Ok(())
    }
}

fn ns_key(index: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(index.len() + 1 + key.len());
    out.extend_from_slice(index.as_bytes());
    out.push(0);
    out.extend_from_slice(key);
    out
}

fn split_ns(ns: &[u8]) -> (&[u8], &[u8]) {
    match ns.iter().position(|&b| b == 0) {
        Some(pos) => (&ns[..pos], &ns[pos + 1..]),
        None => (&[], ns),
    }
}

/// An engine-wide transaction. Writes to any index buffer locally and
/// stay invisible to other transactions until commit.
pub struct Transaction {
    tx: Tx,
    shared: Arc<Shared>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.tx.id()
    }

    /// Read view: versions with `lsn <= vlsn` are visible.
    pub fn vlsn(&self) -> u64 {
        self.tx.vlsn()
    }

    pub fn status(&self) -> TxStatus {
        self.tx.status()
    }

    /// Point read: own uncommitted write first, then the tree at this
    /// transaction's read view.
    pub fn get(&self, index: &Index, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let ns = ns_key(index.name(), key);
        if let Some(w) = self.tx.own_write(&ns) {
            if w.is_delete() {
                return Ok(None);
            }
            if w.flags & DocFlags::UPSERT != 0 {
                let base = index.tree.get(key, self.tx.vlsn())?;
                let folded =
                    (index.tree.scheme().upsert)(base.as_ref().map(|d| d.value()), &w.value);
                return Ok(Some(folded));
            }
            return Ok(Some(w.value.clone()));
        }
        let doc = index.tree.get(key, self.tx.vlsn())?;
        Ok(doc.map(|d| d.value().to_vec()))
    }

    pub fn set(&mut self, index: &Index, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared
            .tx
            .set(&mut self.tx, ns_key(index.name(), key), value.to_vec(), 0)
    }

    pub fn delete(&mut self, index: &Index, key: &[u8]) -> Result<()> {
        self.shared.tx.set(
            &mut self.tx,
            ns_key(index.name(), key),
            Vec::new(),
            DocFlags::DELETE,
        )
    }

    /// Buffer an incremental update. Consecutive buffered writes to the
    /// same key combine immediately through the index's upsert callback.
    pub fn upsert(&mut self, index: &Index, key: &[u8], value: &[u8]) -> Result<()> {
        let ns = ns_key(index.name(), key);
        let (value, flags) = match self.tx.own_write(&ns) {
            None => (value.to_vec(), DocFlags::UPSERT),
            Some(prev) if prev.is_delete() => {
                ((index.tree.scheme().upsert)(None, value), 0)
            }
            Some(prev) if prev.flags & DocFlags::UPSERT != 0 => (
                (index.tree.scheme().upsert)(Some(&prev.value), value),
                DocFlags::UPSERT,
            ),
            Some(prev) => ((index.tree.scheme().upsert)(Some(&prev.value), value), 0),
        };
        self.shared.tx.set(&mut self.tx, ns, value, flags)
    }

    /// Check whether the transaction could commit right now without
    /// committing it.
    pub fn prepare(&self) -> Result<()> {
        self.shared.tx.prepare(&self.tx)
    }

    /// Commit: stamp the write-log with a contiguous LSN batch, append
    /// it to the WAL sink, land it in the trees. Returns the last
    /// stamped LSN. `TxLock` leaves the transaction live for retry.
    pub fn commit(&mut self) -> Result<u64> {
        let docs = self.shared.tx.commit(&mut self.tx, self.shared.wal.as_ref())?;
        let last_lsn = match self.tx.status() {
            TxStatus::Committed(lsn) => lsn,
            _ => unreachable!("commit returned Ok on a live transaction"),
        };
        let indexes = self.shared.indexes.lock().unwrap();
        for doc in docs {
            let (name, key) = split_ns(doc.key());
            match indexes.get(std::str::from_utf8(name).unwrap_or("")) {
                Some(tree) => tree.set(Document::new(
                    key.to_vec(),
                    doc.value().to_vec(),
                    doc.lsn(),
                    doc.flags().0,
                ))?,
                // Index dropped while the transaction was open.
                None => debug!(tx = self.tx.id(), "commit write to a dropped index skipped"),
            }
        }
        drop(indexes);
        self.shared.scheduler.kick();
        Ok(last_lsn)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.shared.tx.rollback(&mut self.tx)
    }

    /// This transaction's buffered writes for one index, in scan order,
    /// bounded below (asc) or above (desc) by `from`.
    fn overlay_for(
        &self,
        index: &str,
        order: Order,
        from: &Option<Vec<u8>>,
    ) -> Vec<Arc<Document>> {
        let mut docs: Vec<Arc<Document>> = self
            .tx
            .write_overlay()
            .into_iter()
            .filter_map(|doc| {
                let (name, key) = split_ns(doc.key());
                if name != index.as_bytes() {
                    return None;
                }
                let in_range = match (from, order) {
                    (Some(bound), Order::Asc) => key >= bound.as_slice(),
                    (Some(bound), Order::Desc) => key <= bound.as_slice(),
                    (None, _) => true,
                };
                in_range.then(|| {
                    Document::new(key.to_vec(), doc.value().to_vec(), doc.lsn(), doc.flags().0)
                })
            })
            .collect();
        if order == Order::Desc {
            docs.reverse();
        }
        docs
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.tx.status() == TxStatus::Ready {
            if let Err(e) = self.shared.tx.rollback(&mut self.tx) {
                error!(tx = self.tx.id(), error = %e, "rollback on drop failed");
            }
        }
    }
}

/// Ordered scan results, optionally overlaid with a transaction's
/// uncommitted writes. The overlay wins on equal keys: a buffered
/// delete hides the committed version, a buffered upsert folds over it.
pub struct Cursor {
    inner: TreeCursor,
    /// Committed head not yet consumed by the two-way merge.
    tree_head: Option<Arc<Document>>,
    overlay: std::iter::Peekable<std::vec::IntoIter<Arc<Document>>>,
    order: Order,
    upsert: crate::document::UpsertFn,
}

impl Cursor {
    fn overlay_first(&self, overlay_key: &[u8], tree_key: &[u8]) -> bool {
        match self.order {
            Order::Asc => overlay_key < tree_key,
            Order::Desc => overlay_key > tree_key,
        }
    }

    /// Materialize a buffered write over its committed base, if any.
    fn emit(&self, doc: Arc<Document>, base: Option<&Arc<Document>>) -> Option<Arc<Document>> {
        if doc.is_delete() {
            return None;
        }
        if doc.is_upsert() {
            let folded = (self.upsert)(base.map(|d| d.value()), doc.value());
            return Some(Document::new(doc.key().to_vec(), folded, doc.lsn(), 0));
        }
        Some(doc)
    }
}

impl Iterator for Cursor {
    type Item = Result<Arc<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.tree_head.is_none() {
                match self.inner.next() {
                    Some(Ok(doc)) => self.tree_head = Some(doc),
                    Some(Err(e)) => return Some(Err(e)),
                    None => {}
                }
            }
            let emitted = match (&self.tree_head, self.overlay.peek().cloned()) {
                (None, None) => return None,
                (Some(_), None) => {
                    return Some(Ok(self.tree_head.take().expect("head present")))
                }
                (None, Some(_)) => {
                    let doc = self.overlay.next().expect("peeked");
                    self.emit(doc, None)
                }
                (Some(tree), Some(over)) => {
                    if tree.key() == over.key() {
                        let tree = self.tree_head.take().expect("head present");
                        let doc = self.overlay.next().expect("peeked");
                        self.emit(doc, Some(&tree))
                    } else if self.overlay_first(over.key(), tree.key()) {
                        let doc = self.overlay.next().expect("peeked");
                        self.emit(doc, None)
                    } else {
                        return Some(Ok(self.tree_head.take().expect("head present")));
                    }
                }
            };
            if let Some(doc) = emitted {
                return Some(Ok(doc));
            }
        }
    }
}
