//! Documents: the immutable key/value records every layer of the
//! engine trades in, plus the scheme (comparator + upsert callback)
//! and the engine-wide sequence allocator.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Document flag bits. Within one transaction's life flag bits are
/// monotonic: once set they are never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocFlags(pub u8);

impl DocFlags {
    pub const GET: u8 = 1 << 0;
    pub const DELETE: u8 = 1 << 1;
    pub const UPSERT: u8 = 1 << 2;
    pub const DUP: u8 = 1 << 3;
    pub const CONFLICT: u8 = 1 << 4;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Immutable key+value record stamped with a log sequence number.
///
/// Shared by `Arc`: index slots, transaction write-logs and read
/// results all hold references; the document is freed when the last
/// one drops. Only the flag byte mutates after construction, and only
/// monotonically.
#[derive(Debug)]
pub struct Document {
    key: Vec<u8>,
    value: Vec<u8>,
    lsn: u64,
    flags: AtomicU8,
}

impl Document {
    pub fn new(key: Vec<u8>, value: Vec<u8>, lsn: u64, flags: u8) -> Arc<Self> {
        Arc::new(Self {
            key,
            value,
            lsn,
            flags: AtomicU8::new(flags),
        })
    }

    pub fn tombstone(key: Vec<u8>, lsn: u64) -> Arc<Self> {
        Self::new(key, Vec::new(), lsn, DocFlags::DELETE)
    }

    pub fn upsert(key: Vec<u8>, value: Vec<u8>, lsn: u64) -> Arc<Self> {
        Self::new(key, value, lsn, DocFlags::UPSERT)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn flags(&self) -> DocFlags {
        DocFlags(self.flags.load(Ordering::Acquire))
    }

    /// Set additional flag bits. Bits are only ever added.
    pub fn set_flag(&self, bit: u8) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn is_delete(&self) -> bool {
        self.flags().contains(DocFlags::DELETE)
    }

    pub fn is_upsert(&self) -> bool {
        self.flags().contains(DocFlags::UPSERT)
    }

    pub fn is_dup(&self) -> bool {
        self.flags().contains(DocFlags::DUP)
    }

    /// Bytes this document pins against the memory quota.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + std::mem::size_of::<Document>()
    }
}

/// Upsert combine callback supplied by the embedding layer: folds an
/// incremental update into the previous value (or none, when the upsert
/// is the oldest statement for the key).
pub type UpsertFn = Arc<dyn Fn(Option<&[u8]>, &[u8]) -> Vec<u8> + Send + Sync>;

/// Key/value scheme for one index: raw-byte comparator plus the upsert
/// combine function. Keys compare in plain memcmp order.
#[derive(Clone)]
pub struct Scheme {
    pub upsert: UpsertFn,
}

impl Scheme {
    /// Scheme whose upsert callback replaces the previous value
    /// wholesale; indexes that never issue upserts can use it as-is.
    pub fn replacing() -> Self {
        Self {
            upsert: Arc::new(|_prev, update| update.to_vec()),
        }
    }

    pub fn with_upsert(upsert: UpsertFn) -> Self {
        Self { upsert }
    }
}

impl std::fmt::Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheme").finish_non_exhaustive()
    }
}

/// Monotonic counters shared across the engine: LSN, transaction id,
/// node id, branch id. Each advances independently under one small
/// lock.
#[derive(Debug, Default)]
pub struct Sequence {
    inner: Mutex<SequenceState>,
}

#[derive(Debug, Default)]
struct SequenceState {
    lsn: u64,
    tx_id: u64,
    node_id: u64,
    branch_id: u64,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_lsn(&self) -> u64 {
        let mut state = self.inner.lock().unwrap();
        state.lsn += 1;
        state.lsn
    }

    /// Advance the LSN counter by `n` and return the first allocated
    /// value; a committing transaction stamps its write-log from here.
    pub fn next_lsn_batch(&self, n: u64) -> u64 {
        let mut state = self.inner.lock().unwrap();
        let first = state.lsn + 1;
        state.lsn += n;
        first
    }

    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().unwrap().lsn
    }

    /// Fast-forward the LSN counter during recovery; never rewinds.
    pub fn observe_lsn(&self, lsn: u64) {
        let mut state = self.inner.lock().unwrap();
        state.lsn = state.lsn.max(lsn);
    }

    pub fn next_tx_id(&self) -> u64 {
        let mut state = self.inner.lock().unwrap();
        state.tx_id += 1;
        state.tx_id
    }

    pub fn next_node_id(&self) -> u64 {
        let mut state = self.inner.lock().unwrap();
        state.node_id += 1;
        state.node_id
    }

    pub fn observe_node_id(&self, id: u64) {
        let mut state = self.inner.lock().unwrap();
        state.node_id = state.node_id.max(id);
    }

    pub fn next_branch_id(&self) -> u64 {
        let mut state = self.inner.lock().unwrap();
        state.branch_id += 1;
        state.branch_id
    }

    pub fn observe_branch_id(&self, id: u64) {
        let mut state = self.inner.lock().unwrap();
        state.branch_id = state.branch_id.max(id);
    }
}

/// Write-ahead-log hook. The engine hands every committing batch to the
/// sink and assumes durability once `append` returns `Ok`; it replays
/// nothing on its own behalf.
pub trait WalSink: Send + Sync {
    fn append(&self, batch: &[Arc<Document>], first_lsn: u64) -> Result<()>;
}

/// Default sink for embedders that manage durability elsewhere.
pub struct NullWal;

impl WalSink for NullWal {
    fn append(&self, _batch: &[Arc<Document>], _first_lsn: u64) -> Result<()> {
        Ok(())
    }
}
