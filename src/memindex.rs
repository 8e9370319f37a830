//! In-memory generation index: the mutable half of a node.
//!
//! Documents are ordered by (key ascending, LSN descending), so the
//! first entry for any key is always its newest version. Older
//! versions of the same key are tagged DUP on insert, keeping the
//! invariant that at most one in-memory head per key is non-duplicate.

use std::cmp::Reverse;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::document::{DocFlags, Document};
use crate::error::Result;
use crate::quota::Quota;

/// Iteration direction for range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Composite ordering key: key bytes ascending, then LSN descending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MemKey {
    key: Vec<u8>,
    lsn: Reverse<u64>,
}

impl MemKey {
    fn new(key: Vec<u8>, lsn: u64) -> Self {
        Self {
            key,
            lsn: Reverse(lsn),
        }
    }

    /// Smallest composite key for `key`: sorts before every version.
    fn newest(key: &[u8]) -> Self {
        Self::new(key.to_vec(), u64::MAX)
    }

    /// Largest composite key for `key`: sorts after every version.
    fn oldest(key: &[u8]) -> Self {
        Self::new(key.to_vec(), 0)
    }
}

pub struct MemIndex {
    map: SkipMap<MemKey, Arc<Document>>,
    quota: Arc<Quota>,
    used: AtomicUsize,
    min_lsn: AtomicU64,
    max_lsn: AtomicU64,
    dup_count: AtomicUsize,
}

impl MemIndex {
    pub fn new(quota: Arc<Quota>) -> Self {
        Self {
            map: SkipMap::new(),
            quota,
            used: AtomicUsize::new(0),
            min_lsn: AtomicU64::new(u64::MAX),
            max_lsn: AtomicU64::new(0),
            dup_count: AtomicUsize::new(0),
        }
    }

    /// Ordered insert. Blocks on the quota gate if the engine is over
    /// its memory limit; the only failure is quota exhaustion.
    pub fn insert(&self, doc: Arc<Document>) -> Result<()> {
        self.quota.acquire(doc.size())?;
        self.adopt(doc);
        Ok(())
    }

    /// Insert an entry whose bytes are already reserved against the
    /// quota. A split moves retired generations into successor nodes
    /// with this; the donor calls `forget_quota` once every entry has
    /// changed hands, so the reservation is neither doubled nor lost.
    pub(crate) fn adopt(&self, doc: Arc<Document>) {
        let size = doc.size();
        self.used.fetch_add(size, AtomicOrdering::SeqCst);
        self.min_lsn.fetch_min(doc.lsn(), AtomicOrdering::SeqCst);
        self.max_lsn.fetch_max(doc.lsn(), AtomicOrdering::SeqCst);

        let mem_key = MemKey::new(doc.key().to_vec(), doc.lsn());
        self.map.insert(mem_key.clone(), doc);
        self.retag_dups(&mem_key);
    }

    /// After inserting `at`, every version of the key except the newest
    /// must carry DUP. Only the inserted entry and its newer neighbor
    /// can be affected, so the walk is bounded.
    fn retag_dups(&self, at: &MemKey) {
        let newest = MemKey::newest(&at.key);
        let mut iter = self
            .map
            .range((Bound::Included(newest), Bound::Included(MemKey::oldest(&at.key))));
        if let Some(head) = iter.next() {
            for older in iter {
                let doc = older.value();
                if !doc.is_dup() {
                    doc.set_flag(DocFlags::DUP);
                    self.dup_count.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }
            // The head must be the non-DUP entry; an insert of an
            // out-of-order (older) version lands below an existing
            // head and was tagged by the loop above.
            debug_assert!(head.value().lsn() >= at.lsn.0 || head.value().is_dup());
        }
    }

    /// Newest version of `key` with `lsn <= max_lsn`.
    pub fn find(&self, key: &[u8], max_lsn: u64) -> Option<Arc<Document>> {
        let from = MemKey::new(key.to_vec(), max_lsn);
        let entry = self
            .map
            .range((Bound::Included(from), Bound::Included(MemKey::oldest(key))))
            .next()?;
        debug_assert_eq!(entry.key().key.as_slice(), key);
        Some(Arc::clone(entry.value()))
    }

    /// Owning cursor over the index. `from` bounds the scan start
    /// (inclusive); `None` starts at the extreme end for the order.
    pub fn range(self: &Arc<Self>, order: Order, from: Option<&[u8]>) -> MemCursor {
        MemCursor {
            index: Arc::clone(self),
            order,
            pos: from.map(|key| match order {
                Order::Asc => MemKey::newest(key),
                Order::Desc => MemKey::oldest(key),
            }),
            started: false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(AtomicOrdering::SeqCst)
    }

    pub fn min_lsn(&self) -> u64 {
        self.min_lsn.load(AtomicOrdering::SeqCst)
    }

    pub fn max_lsn(&self) -> u64 {
        self.max_lsn.load(AtomicOrdering::SeqCst)
    }

    /// Fraction of entries shadowed by a newer version, in percent.
    pub fn dup_percent(&self) -> u8 {
        let len = self.len();
        if len == 0 {
            return 0;
        }
        ((self.dup_count.load(AtomicOrdering::SeqCst) * 100) / len) as u8
    }

    /// Snapshot of all entries in (key asc, lsn desc) order.
    pub fn collect(&self) -> Vec<Arc<Document>> {
        self.map.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Return all pinned bytes to the quota. Called once the index has
    /// been flushed to a branch or its node dropped.
    pub fn release_quota(&self) {
        let used = self.used.swap(0, AtomicOrdering::SeqCst);
        if used > 0 {
            self.quota.release(used);
        }
    }

    /// Zero the byte counter without releasing. The reservation now
    /// belongs to the indexes that adopted this generation's entries.
    pub(crate) fn forget_quota(&self) {
        self.used.store(0, AtomicOrdering::SeqCst);
    }
}

impl Drop for MemIndex {
    fn drop(&mut self) {
        self.release_quota();
    }
}

/// Owning iterator stepping the skip map one entry at a time, so that
/// cursors survive past the scope that created them and observe a
/// consistent order even while writers insert concurrently.
pub struct MemCursor {
    index: Arc<MemIndex>,
    order: Order,
    pos: Option<MemKey>,
    started: bool,
}

impl Iterator for MemCursor {
    type Item = Arc<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.order {
            Order::Asc => match (&self.pos, self.started) {
                (None, false) => self.index.map.front(),
                (None, true) => None,
                (Some(pos), false) => self.index.map.lower_bound(Bound::Included(pos)),
                (Some(pos), true) => self.index.map.lower_bound(Bound::Excluded(pos)),
            },
            Order::Desc => match (&self.pos, self.started) {
                (None, false) => self.index.map.back(),
                (None, true) => None,
                (Some(pos), false) => self.index.map.upper_bound(Bound::Included(pos)),
                (Some(pos), true) => self.index.map.upper_bound(Bound::Excluded(pos)),
            },
        }?;
        self.started = true;
        self.pos = Some(entry.key().clone());
        Some(Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Arc<MemIndex> {
        Arc::new(MemIndex::new(Arc::new(Quota::new(1024 * 1024))))
    }

    #[test]
    fn test_newest_version_first() {
        let idx = index();
        for lsn in [3u64, 1, 2] {
            idx.insert(Document::new(
                b"key".to_vec(),
                format!("v{}", lsn).into_bytes(),
                lsn,
                0,
            ))
            .expect("Insert failed");
        }

        let found = idx.find(b"key", u64::MAX).expect("Key missing");
        assert_eq!(found.lsn(), 3);
        assert_eq!(found.value(), b"v3");
    }

    #[test]
    fn test_find_respects_max_lsn() {
        let idx = index();
        for lsn in 1..=5u64 {
            idx.insert(Document::new(
                b"key".to_vec(),
                format!("v{}", lsn).into_bytes(),
                lsn,
                0,
            ))
            .unwrap();
        }

        assert_eq!(idx.find(b"key", 3).unwrap().lsn(), 3);
        assert_eq!(idx.find(b"key", 1).unwrap().lsn(), 1);
        assert_eq!(idx.find(b"key", u64::MAX).unwrap().lsn(), 5);
    }

    #[test]
    fn test_only_head_is_non_dup() {
        let idx = index();
        for lsn in 1..=4u64 {
            idx.insert(Document::new(b"dup".to_vec(), vec![], lsn, 0))
                .unwrap();
        }

        let versions = idx.collect();
        assert_eq!(versions.len(), 4);
        assert!(!versions[0].is_dup(), "Head must stay non-duplicate");
        for older in &versions[1..] {
            assert!(older.is_dup(), "Older version lsn={} untagged", older.lsn());
        }
        assert_eq!(idx.dup_percent(), 75);
    }

    #[test]
    fn test_out_of_order_insert_tags_older() {
        let idx = index();
        idx.insert(Document::new(b"k".to_vec(), b"new".to_vec(), 10, 0))
            .unwrap();
        idx.insert(Document::new(b"k".to_vec(), b"old".to_vec(), 5, 0))
            .unwrap();

        let versions = idx.collect();
        assert_eq!(versions[0].lsn(), 10);
        assert!(!versions[0].is_dup());
        assert!(versions[1].is_dup());
    }

    #[test]
    fn test_ascending_and_descending_cursors() {
        let idx = index();
        for key in ["a", "c", "b"] {
            idx.insert(Document::new(key.into(), b"v".to_vec(), 1, 0))
                .unwrap();
        }

        let asc: Vec<Vec<u8>> = idx
            .range(Order::Asc, None)
            .map(|d| d.key().to_vec())
            .collect();
        assert_eq!(asc, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let desc: Vec<Vec<u8>> = idx
            .range(Order::Desc, None)
            .map(|d| d.key().to_vec())
            .collect();
        assert_eq!(desc, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_range_from_key() {
        let idx = index();
        for key in ["apple", "banana", "cherry"] {
            idx.insert(Document::new(key.into(), b"v".to_vec(), 1, 0))
                .unwrap();
        }

        let from_b: Vec<Vec<u8>> = idx
            .range(Order::Asc, Some(b"banana"))
            .map(|d| d.key().to_vec())
            .collect();
        assert_eq!(from_b, vec![b"banana".to_vec(), b"cherry".to_vec()]);
    }

    #[test]
    fn test_quota_accounting() {
        let quota = Arc::new(Quota::new(1024 * 1024));
        let idx = Arc::new(MemIndex::new(Arc::clone(&quota)));

        idx.insert(Document::new(b"k".to_vec(), b"value".to_vec(), 1, 0))
            .unwrap();
        assert!(quota.used() > 0);
        assert_eq!(quota.used(), idx.used_bytes());

        idx.release_quota();
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn test_adopt_transfers_reservation() {
        let quota = Arc::new(Quota::new(1024 * 1024));
        let donor = Arc::new(MemIndex::new(Arc::clone(&quota)));
        donor
            .insert(Document::new(b"k".to_vec(), b"value".to_vec(), 1, 0))
            .unwrap();
        let pinned = quota.used();

        let heir = Arc::new(MemIndex::new(Arc::clone(&quota)));
        for doc in donor.collect() {
            heir.adopt(doc);
        }
        donor.forget_quota();
        drop(donor);

        assert_eq!(quota.used(), pinned, "Reservation must change hands once");
        assert_eq!(heir.used_bytes(), pinned);
        assert_eq!(heir.find(b"k", u64::MAX).unwrap().value(), b"value");
        heir.release_quota();
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn test_lsn_bounds_tracked() {
        let idx = index();
        for lsn in [5u64, 2, 9] {
            idx.insert(Document::new(b"k".to_vec(), vec![], lsn, 0))
                .unwrap();
        }
        assert_eq!(idx.min_lsn(), 2);
        assert_eq!(idx.max_lsn(), 9);
    }
}
