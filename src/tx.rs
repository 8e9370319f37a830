//! Optimistic MVCC transaction manager.
//!
//! Transactions buffer writes locally and publish a pending marker per
//! written key. Nothing blocks at write time; all outcomes surface at
//! prepare:
//!
//!   - a newer committed version on a written key  -> `TxConflict`
//!   - a pending write by another live transaction -> `TxLock`
//!   - the induced wait-for graph contains a cycle -> `TxDeadlock`
//!
//! `TxLock` is retryable: the transaction stays live and may prepare
//! again once the blocker finishes. Conflict and deadlock abort the
//! transaction.
//!
//! Commit stamps the write-log with a contiguous LSN batch, hands the
//! batch to the WAL sink, and records the touched keys for deferred
//! garbage collection: a key slot is dropped only once no live read
//! view could still conflict on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::document::{DocFlags, Document, Sequence, WalSink};
use crate::error::{Error, Result};

/// A buffered, not-yet-committed write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub value: Vec<u8>,
    pub flags: u8,
}

impl PendingWrite {
    pub fn is_delete(&self) -> bool {
        self.flags & DocFlags::DELETE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ready,
    /// Holds the last LSN stamped at commit.
    Committed(u64),
    RolledBack,
}

/// Transaction handle. Owned by the caller; every operation goes back
/// through the manager that issued it.
pub struct Tx {
    id: u64,
    vlsn: u64,
    status: TxStatus,
    writes: BTreeMap<Vec<u8>, PendingWrite>,
}

impl Tx {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read view: this transaction observes versions with `lsn <= vlsn`.
    pub fn vlsn(&self) -> u64 {
        self.vlsn
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Read-your-writes lookup against the local write-log.
    pub fn own_write(&self, key: &[u8]) -> Option<&PendingWrite> {
        self.writes.get(key)
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Materialize the write-log as documents stamped with `vlsn`, in
    /// key order. Used to overlay a cursor with uncommitted writes.
    pub fn write_overlay(&self) -> Vec<Arc<Document>> {
        self.writes
            .iter()
            .map(|(key, w)| Document::new(key.clone(), w.value.clone(), self.vlsn, w.flags))
            .collect()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.status {
            TxStatus::Ready => Ok(()),
            TxStatus::RolledBack => Err(Error::TxRollback),
            TxStatus::Committed(_) => Err(Error::InvalidState(format!(
                "transaction {} already committed",
                self.id
            ))),
        }
    }
}

/// Per-key conflict slot: the newest committed LSN plus the set of live
/// transactions with a pending write on the key.
#[derive(Debug, Default)]
struct KeySlot {
    committed_lsn: u64,
    pending: Vec<u64>,
}

#[derive(Debug, Default)]
struct ManagerState {
    /// Live transaction id -> its read view.
    live: BTreeMap<u64, u64>,
    /// Wait-for edges recorded by blocked prepares.
    waits: HashMap<u64, HashSet<u64>>,
    /// Commit LSN -> keys whose slots become collectable once every
    /// read view has advanced past it.
    gc: BTreeMap<u64, Vec<Vec<u8>>>,
}

pub struct TxManager {
    seq: Arc<Sequence>,
    slots: Mutex<BTreeMap<Vec<u8>, KeySlot>>,
    state: Mutex<ManagerState>,
}

impl TxManager {
    pub fn new(seq: Arc<Sequence>) -> Self {
        Self {
            seq,
            slots: Mutex::new(BTreeMap::new()),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn begin(&self) -> Tx {
        let id = self.seq.next_tx_id();
        let vlsn = self.seq.current_lsn();
        self.state.lock().unwrap().live.insert(id, vlsn);
        debug!(tx = id, vlsn, "begin transaction");
        Tx {
            id,
            vlsn,
            status: TxStatus::Ready,
            writes: BTreeMap::new(),
        }
    }

    /// Buffer a write. A second write to the same key inside one
    /// transaction replaces the first in place.
    pub fn set(&self, tx: &mut Tx, key: Vec<u8>, value: Vec<u8>, flags: u8) -> Result<()> {
        tx.ensure_ready()?;
        let first_touch = !tx.writes.contains_key(&key);
        if first_touch {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(key.clone()).or_default().pending.push(tx.id);
        }
        tx.writes.insert(key, PendingWrite { value, flags });
        Ok(())
    }

    /// Check whether `tx` could commit right now. Outcomes are ordered:
    /// conflicts beat locks, and a lock that closes a wait cycle is a
    /// deadlock.
    pub fn prepare(&self, tx: &Tx) -> Result<()> {
        tx.ensure_ready()?;
        let mut blockers: HashSet<u64> = HashSet::new();
        {
            let slots = self.slots.lock().unwrap();
            for key in tx.writes.keys() {
                let Some(slot) = slots.get(key) else { continue };
                if slot.committed_lsn > tx.vlsn {
                    return Err(Error::TxConflict);
                }
                for &owner in &slot.pending {
                    if owner != tx.id {
                        blockers.insert(owner);
                    }
                }
            }
        }
        if blockers.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        // Only live blockers count; a finished transaction left no lock.
        blockers.retain(|id| state.live.contains_key(id));
        if blockers.is_empty() {
            return Ok(());
        }
        state.waits.entry(tx.id).or_default().extend(&blockers);
        if Self::closes_cycle(&state.waits, tx.id) {
            debug!(tx = tx.id, "wait-for cycle detected");
            return Err(Error::TxDeadlock);
        }
        Err(Error::TxLock)
    }

    /// DFS over the wait-for graph: does any path from `from` lead back
    /// to `from`?
    fn closes_cycle(waits: &HashMap<u64, HashSet<u64>>, from: u64) -> bool {
        let mut stack: Vec<u64> = match waits.get(&from) {
            Some(edges) => edges.iter().copied().collect(),
            None => return false,
        };
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == from {
                return true;
            }
            if visited.insert(node) {
                if let Some(edges) = waits.get(&node) {
                    stack.extend(edges.iter().copied());
                }
            }
        }
        false
    }

    /// Commit the transaction. On success returns the stamped write-log
    /// in key order, ready for insertion into the tree. `TxLock` leaves
    /// the transaction live for retry; conflict and deadlock roll it
    /// back before returning.
    pub fn commit(&self, tx: &mut Tx, wal: &dyn WalSink) -> Result<Vec<Arc<Document>>> {
        tx.ensure_ready()?;
        if tx.writes.is_empty() {
            self.finish(tx.id);
            tx.status = TxStatus::Committed(tx.vlsn);
            return Ok(Vec::new());
        }

        match self.prepare(tx) {
            Ok(()) => {}
            Err(Error::TxLock) => return Err(Error::TxLock),
            Err(e) => {
                self.rollback(tx)?;
                return Err(e);
            }
        }

        let count = tx.writes.len() as u64;
        let first_lsn = self.seq.next_lsn_batch(count);
        let docs: Vec<Arc<Document>> = tx
            .writes
            .iter()
            .zip(first_lsn..)
            .map(|((key, w), lsn)| Document::new(key.clone(), w.value.clone(), lsn, w.flags))
            .collect();

        if let Err(e) = wal.append(&docs, first_lsn) {
            self.rollback(tx)?;
            return Err(e);
        }

        let last_lsn = first_lsn + count - 1;
        {
            let mut slots = self.slots.lock().unwrap();
            for doc in &docs {
                let slot = slots.entry(doc.key().to_vec()).or_default();
                slot.committed_lsn = slot.committed_lsn.max(doc.lsn());
                slot.pending.retain(|&id| id != tx.id);
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.live.remove(&tx.id);
            state.waits.remove(&tx.id);
            state
                .gc
                .entry(last_lsn)
                .or_default()
                .extend(tx.writes.keys().cloned());
        }

        debug!(tx = tx.id, first_lsn, last_lsn, "committed");
        tx.status = TxStatus::Committed(last_lsn);
        Ok(docs)
    }

    pub fn rollback(&self, tx: &mut Tx) -> Result<()> {
        match tx.status {
            TxStatus::Ready => {}
            TxStatus::RolledBack => return Ok(()),
            TxStatus::Committed(_) => {
                return Err(Error::InvalidState(format!(
                    "transaction {} already committed",
                    tx.id
                )))
            }
        }
        {
            let mut slots = self.slots.lock().unwrap();
            for key in tx.writes.keys() {
                if let Some(slot) = slots.get_mut(key) {
                    slot.pending.retain(|&id| id != tx.id);
                    if slot.pending.is_empty() && slot.committed_lsn == 0 {
                        slots.remove(key);
                    }
                }
            }
        }
        self.finish(tx.id);
        debug!(tx = tx.id, "rolled back");
        tx.status = TxStatus::RolledBack;
        Ok(())
    }

    fn finish(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(&id);
        state.waits.remove(&id);
    }

    /// Oldest read view any live transaction holds; the engine's GC
    /// horizon. With no live transactions this is the current LSN.
    pub fn oldest_vlsn(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .live
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.seq.current_lsn())
    }

    /// Read views of all live transactions, for snapshot-preserving
    /// rewrites.
    pub fn live_snapshots(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.live.values().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Drop conflict slots no live read view can still observe.
    /// Returns the number of slots released.
    pub fn gc(&self) -> usize {
        let horizon = self.oldest_vlsn();
        let expired: Vec<Vec<u8>> = {
            let mut state = self.state.lock().unwrap();
            let keep = state.gc.split_off(&(horizon + 1));
            let expired = std::mem::replace(&mut state.gc, keep);
            expired.into_values().flatten().collect()
        };

        let mut released = 0;
        let mut slots = self.slots.lock().unwrap();
        for key in expired {
            if let Some(slot) = slots.get(&key) {
                if slot.pending.is_empty() && slot.committed_lsn <= horizon {
                    slots.remove(&key);
                    released += 1;
                }
            }
        }
        if released > 0 {
            debug!(released, horizon, "transaction gc");
        }
        released
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
