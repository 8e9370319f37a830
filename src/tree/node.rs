//! A node: one disjoint key range of an index.
//!
//! ```text
//!              +--------- node ---------+
//!              |  i0   (active memory)  |
//!              |  i1   (being flushed)  |
//!              |  b0   (newest branch)  |
//!              |  b1                    |
//!              |  b2   (oldest branch)  |
//!              +------------------------+
//! ```
//!
//! Writes land in `i0`. A branch task rotates `i0` into `i1`, writes a
//! branch, then swaps the branch in and drops `i1`. At most one
//! rotation is in flight per node; the `busy` flag keeps the planner
//! from scheduling two tasks against the same node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::disk::Branch;
use crate::document::{Document, UpsertFn};
use crate::error::Result;
use crate::iterator::StmtSource;
use crate::memindex::{MemIndex, Order};
use crate::quota::Quota;
use crate::statement::Statement;
use crate::vfs::Vfs;

struct Gens {
    i0: Arc<MemIndex>,
    i1: Option<Arc<MemIndex>>,
    /// A retired node accepts no more writes; the tree re-routes to
    /// its successors.
    retired: bool,
}

pub struct Node {
    id: u64,
    first_key: Vec<u8>,
    gens: RwLock<Gens>,
    /// Newest first.
    branches: RwLock<Vec<Arc<Branch>>>,
    busy: AtomicBool,
    /// Read counter; grows monotonically while the node is hot.
    temperature: AtomicU64,
    last_branch: Mutex<Instant>,
}

impl Node {
    pub fn new(id: u64, first_key: Vec<u8>, quota: &Arc<Quota>) -> Arc<Self> {
        Self::with_branches(id, first_key, Vec::new(), quota)
    }

    pub fn with_branches(
        id: u64,
        first_key: Vec<u8>,
        branches: Vec<Arc<Branch>>,
        quota: &Arc<Quota>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            first_key,
            gens: RwLock::new(Gens {
                i0: Arc::new(MemIndex::new(Arc::clone(quota))),
                i1: None,
                retired: false,
            }),
            branches: RwLock::new(branches),
            busy: AtomicBool::new(false),
            temperature: AtomicU64::new(0),
            last_branch: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inclusive lower bound of the key range this node owns.
    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    /// Insert into the active generation. Returns `false` when the
    /// node has been retired by a split; the caller must re-route.
    pub fn set(&self, doc: Arc<Document>) -> Result<bool> {
        let gens = self.gens.read().unwrap();
        if gens.retired {
            return Ok(false);
        }
        gens.i0.insert(doc)?;
        Ok(true)
    }

    /// Point lookup with upsert folding: walks sources newest to
    /// oldest, collecting the version chain until a base value, a
    /// tombstone, or the bottom of the node.
    pub fn get(
        &self,
        vfs: &dyn Vfs,
        key: &[u8],
        vlsn: u64,
        upsert: &UpsertFn,
    ) -> Result<Option<Arc<Document>>> {
        self.temperature.fetch_add(1, AtomicOrdering::Relaxed);

        // Upsert payloads newest first; `base` terminates the chain.
        let mut chain: Vec<Vec<u8>> = Vec::new();
        let mut head_lsn = 0u64;
        let mut base: Option<Vec<u8>> = None;
        let mut done = false;

        let (i0, i1) = {
            let gens = self.gens.read().unwrap();
            (Arc::clone(&gens.i0), gens.i1.clone())
        };
        for index in [Some(i0), i1].into_iter().flatten() {
            let cursor = index.range(Order::Asc, Some(key));
            for doc in cursor {
                if doc.key() != key {
                    break;
                }
                if doc.lsn() > vlsn {
                    continue;
                }
                if chain.is_empty() && base.is_none() {
                    head_lsn = doc.lsn();
                }
                if doc.is_delete() {
                    done = true;
                    break;
                }
                if doc.is_upsert() {
                    chain.push(doc.value().to_vec());
                    continue;
                }
                base = Some(doc.value().to_vec());
                done = true;
                break;
            }
            if done {
                break;
            }
        }

        if !done {
            let branches = self.branches.read().unwrap().clone();
            let mut max_lsn = vlsn;
            'outer: for branch in branches {
                if !branch.maybe_contains(key) {
                    continue;
                }
                // A branch may hold several links of the chain; step
                // down through its versions one lookup at a time.
                while let Some(entry) = branch.get(vfs, key, max_lsn)? {
                    if chain.is_empty() && base.is_none() {
                        head_lsn = entry.lsn;
                    }
                    if entry.flags & crate::document::DocFlags::DELETE != 0 {
                        break 'outer;
                    }
                    if entry.flags & crate::document::DocFlags::UPSERT != 0 {
                        max_lsn = entry.lsn.saturating_sub(1);
                        chain.push(entry.value);
                        continue;
                    }
                    base = Some(entry.value);
                    break 'outer;
                }
            }
        }

        if chain.is_empty() && base.is_none() {
            return Ok(None);
        }
        let mut acc = base;
        for payload in chain.iter().rev() {
            acc = Some((upsert)(acc.as_deref(), payload));
        }
        Ok(acc.map(|value| Document::new(key.to_vec(), value, head_lsn, 0)))
    }

    /// Statement sources for this node, newest first, positioned at
    /// `from`. Feeds the merge iterator.
    pub fn sources(
        &self,
        vfs: &Arc<dyn Vfs>,
        order: Order,
        from: Option<&[u8]>,
    ) -> Vec<StmtSource> {
        let mut sources: Vec<StmtSource> = Vec::new();
        let (i0, i1) = {
            let gens = self.gens.read().unwrap();
            (Arc::clone(&gens.i0), gens.i1.clone())
        };
        sources.push(Box::new(i0.range(order, from).map(|d| Ok(Statement::Mem(d)))));
        if let Some(i1) = i1 {
            sources.push(Box::new(i1.range(order, from).map(|d| Ok(Statement::Mem(d)))));
        }
        for branch in self.branches.read().unwrap().iter() {
            let cursor = branch.cursor(
                Arc::clone(vfs),
                order == Order::Asc,
                from.map(|k| k.to_vec()),
            );
            sources.push(Box::new(cursor.map(|r| r.map(Statement::Disk))));
        }
        sources
    }

    /// Rotate `i0` into `i1` for flushing. Returns the generation to
    /// flush, or `None` when a flush is already in flight or there is
    /// nothing to write.
    pub fn rotate(&self, quota: &Arc<Quota>) -> Option<Arc<MemIndex>> {
        let mut gens = self.gens.write().unwrap();
        if gens.i1.is_some() || gens.i0.is_empty() {
            return None;
        }
        let fresh = Arc::new(MemIndex::new(Arc::clone(quota)));
        let rotated = std::mem::replace(&mut gens.i0, fresh);
        gens.i1 = Some(Arc::clone(&rotated));
        Some(rotated)
    }

    /// The generation a flush should write: a leftover `i1` from an
    /// interrupted flush takes priority over rotating a fresh one.
    pub fn flush_source(&self, quota: &Arc<Quota>) -> Option<Arc<MemIndex>> {
        {
            let gens = self.gens.read().unwrap();
            if let Some(i1) = &gens.i1 {
                return Some(Arc::clone(i1));
            }
        }
        self.rotate(quota)
    }

    /// Retire the node for a split: no further writes land here. The
    /// generations stay in place so the node remains readable until the
    /// successors are published; the returned handles are partitioned
    /// among them.
    pub fn retire(&self) -> (Arc<MemIndex>, Option<Arc<MemIndex>>) {
        let mut gens = self.gens.write().unwrap();
        gens.retired = true;
        (Arc::clone(&gens.i0), gens.i1.clone())
    }

    /// Seed a successor with memory inherited from the node it
    /// replaces. Must run before the successor is published to readers.
    pub(crate) fn inherit_memory(&self, generation: Arc<MemIndex>) {
        self.gens.write().unwrap().i1 = Some(generation);
    }

    /// Install the branch written from `i1` and retire the generation.
    pub fn complete_branch(&self, branch: Arc<Branch>) {
        {
            let mut branches = self.branches.write().unwrap();
            branches.insert(0, branch);
        }
        let retired = {
            let mut gens = self.gens.write().unwrap();
            gens.i1.take()
        };
        if let Some(retired) = retired {
            retired.release_quota();
        }
        *self.last_branch.lock().unwrap() = Instant::now();
    }

    /// A flush whose write produced nothing still retires `i1`.
    pub fn discard_rotation(&self) {
        let retired = self.gens.write().unwrap().i1.take();
        if let Some(retired) = retired {
            retired.release_quota();
        }
        *self.last_branch.lock().unwrap() = Instant::now();
    }

    /// Swap `old_ids` out for an optional replacement branch, keeping
    /// newest-first order. Used when a compaction commits.
    pub fn replace_branches(&self, old_ids: &[u64], replacement: Option<Arc<Branch>>) {
        let mut branches = self.branches.write().unwrap();
        branches.retain(|b| !old_ids.contains(&b.id()));
        if let Some(replacement) = replacement {
            let at = branches.partition_point(|b| b.max_lsn() > replacement.max_lsn());
            branches.insert(at, replacement);
        }
    }

    pub fn branches(&self) -> Vec<Arc<Branch>> {
        self.branches.read().unwrap().clone()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.read().unwrap().len()
    }

    pub fn mem_bytes(&self) -> usize {
        let gens = self.gens.read().unwrap();
        gens.i0.used_bytes() + gens.i1.as_ref().map_or(0, |i| i.used_bytes())
    }

    pub fn i0_bytes(&self) -> usize {
        self.gens.read().unwrap().i0.used_bytes()
    }

    pub fn i0_dup_percent(&self) -> u8 {
        self.gens.read().unwrap().i0.dup_percent()
    }

    pub fn is_flushing(&self) -> bool {
        self.gens.read().unwrap().i1.is_some()
    }

    pub fn temperature(&self) -> u64 {
        self.temperature.load(AtomicOrdering::Relaxed)
    }

    pub fn since_branch(&self) -> Duration {
        self.last_branch.lock().unwrap().elapsed()
    }

    /// Claim the node for a background task. One task per node.
    pub fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    pub fn release_claim(&self) {
        self.busy.store(false, AtomicOrdering::Release);
    }

    /// Highest LSN any branch of this node holds.
    pub fn max_branch_lsn(&self) -> u64 {
        self.branches
            .read()
            .unwrap()
            .iter()
            .map(|b| b.max_lsn())
            .max()
            .unwrap_or(0)
    }
}
