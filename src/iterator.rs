//! The statement pipeline: k-way merge across ordered sources, the
//! read-side visibility/folding iterator, and the write-side iterator
//! used by flush and compaction.
//!
//! Sources are ordered newest-first: in-memory generations come before
//! branches, newer branches before older ones. Equal-key ties are won
//! by the more recent source, and every statement for a key after the
//! first is tagged DUP.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::document::{DocFlags, UpsertFn};
use crate::error::Result;
use crate::memindex::Order;
use crate::statement::{FoldState, Statement};

pub type StmtSource = Box<dyn Iterator<Item = Result<Statement>> + Send>;

struct HeapEntry {
    stmt: Statement,
    source: usize,
    iter: StmtSource,
    order: Order,
}

impl HeapEntry {
    /// Ranking under the requested order: extremal key first, then LSN
    /// descending, then the more recent (lower-numbered) source.
    fn rank(&self, other: &Self) -> Ordering {
        let by_key = match self.order {
            Order::Asc => self.stmt.key().cmp(other.stmt.key()),
            Order::Desc => other.stmt.key().cmp(self.stmt.key()),
        };
        by_key
            .then_with(|| other.stmt.lsn().cmp(&self.stmt.lsn()))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum; the best-ranked entry must
        // compare greatest.
        self.rank(other).reverse()
    }
}

/// Fans in N ordered statement sources. Emits every statement (not just
/// the winners) in (key, lsn desc, recency) order so downstream
/// iterators can fold version chains; exact (key, lsn) duplicates from
/// overlapping sources are suppressed.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    order: Order,
    last: Option<(Vec<u8>, u64)>,
}

impl MergeIterator {
    pub fn new(sources: Vec<StmtSource>, order: Order) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, mut iter) in sources.into_iter().enumerate() {
            if let Some(first) = iter.next() {
                heap.push(HeapEntry {
                    stmt: first?,
                    source,
                    iter,
                    order,
                });
            }
        }
        Ok(Self {
            heap,
            order,
            last: None,
        })
    }

    fn refill(&mut self, mut entry: HeapEntry) -> Result<()> {
        if let Some(next) = entry.iter.next() {
            entry.stmt = next?;
            self.heap.push(entry);
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.heap.pop()?;
            let mut stmt = entry.stmt.clone();
            if let Err(e) = self.refill(entry) {
                return Some(Err(e));
            }

            match &self.last {
                Some((key, lsn)) if key.as_slice() == stmt.key() => {
                    if *lsn == stmt.lsn() {
                        // Same statement seen through two sources.
                        continue;
                    }
                    tag_dup(&mut stmt);
                }
                _ => {}
            }
            self.last = Some((stmt.key().to_vec(), stmt.lsn()));
            return Some(Ok(stmt));
        }
    }
}

fn tag_dup(stmt: &mut Statement) {
    match stmt {
        Statement::Mem(doc) | Statement::Version { doc, .. } => doc.set_flag(DocFlags::DUP),
        Statement::Disk(entry) => entry.flags |= DocFlags::DUP,
        Statement::Fold(fold) => fold.flags |= DocFlags::DUP,
    }
}

/// Read-side iterator: applies the `lsn <= vlsn` visibility rule,
/// skips tombstones unless asked to surface them, and folds upsert
/// chains through the scheme's combine callback until a base value or
/// delete is reached.
pub struct ReadIterator {
    merge: MergeIterator,
    vlsn: u64,
    include_tombstones: bool,
    upsert: UpsertFn,
    lookahead: Option<Statement>,
}

impl ReadIterator {
    pub fn new(
        merge: MergeIterator,
        vlsn: u64,
        include_tombstones: bool,
        upsert: UpsertFn,
    ) -> Self {
        Self {
            merge,
            vlsn,
            include_tombstones,
            upsert,
            lookahead: None,
        }
    }

    fn pull(&mut self) -> Option<Result<Statement>> {
        if let Some(stmt) = self.lookahead.take() {
            return Some(Ok(stmt));
        }
        self.merge.next()
    }

    /// Fold an upsert chain starting at `head`. Consumes statements for
    /// the same key until a base value, a delete, or the end of the
    /// chain; newer upserts apply over older ones.
    fn fold_chain(&mut self, head: Statement) -> Result<Statement> {
        let key = head.key().to_vec();
        let head_lsn = head.lsn();
        // Chain of upsert payloads, newest first.
        let mut chain = vec![head.value().to_vec()];
        let mut base: Option<Vec<u8>> = None;

        loop {
            let stmt = match self.pull() {
                Some(stmt) => stmt?,
                None => break,
            };
            if stmt.key() != key.as_slice() {
                self.lookahead = Some(stmt);
                break;
            }
            if stmt.lsn() > self.vlsn {
                continue;
            }
            if stmt.is_delete() {
                // Chain bottoms out at a tombstone; base stays absent.
                self.skip_key(&key)?;
                break;
            }
            if stmt.is_upsert() {
                chain.push(stmt.value().to_vec());
                continue;
            }
            base = Some(stmt.value().to_vec());
            self.skip_key(&key)?;
            break;
        }

        let mut acc = base;
        for upsert in chain.iter().rev() {
            acc = Some((self.upsert)(acc.as_deref(), upsert));
        }
        Ok(Statement::Fold(FoldState {
            key,
            value: acc.unwrap_or_default(),
            lsn: head_lsn,
            flags: 0,
        }))
    }

    /// Discard the remaining statements of `key`.
    fn skip_key(&mut self, key: &[u8]) -> Result<()> {
        loop {
            let stmt = match self.pull() {
                Some(stmt) => stmt?,
                None => return Ok(()),
            };
            if stmt.key() != key {
                self.lookahead = Some(stmt);
                return Ok(());
            }
        }
    }
}

impl Iterator for ReadIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let stmt = match self.pull()? {
                Ok(stmt) => stmt,
                Err(e) => return Some(Err(e)),
            };
            if stmt.lsn() > self.vlsn {
                continue;
            }
            let key = stmt.key().to_vec();
            if stmt.is_delete() {
                if let Err(e) = self.skip_key(&key) {
                    return Some(Err(e));
                }
                if self.include_tombstones {
                    return Some(Ok(stmt));
                }
                continue;
            }
            if stmt.is_upsert() {
                return Some(self.fold_chain(stmt));
            }
            if let Err(e) = self.skip_key(&key) {
                return Some(Err(e));
            }
            return Some(Ok(stmt));
        }
    }
}

/// Write-side iterator used by flush and compaction.
///
/// Performs the same folding as the read side, but against the set of
/// live snapshot read views: every snapshot must observe the same
/// result before and after the rewrite. Tracks a per-page byte budget
/// for the caller; `page_full` flips once the budget is exceeded and
/// `begin_page` starts the next page.
pub struct WriteIterator {
    merge: MergeIterator,
    upsert: UpsertFn,
    /// Live snapshot read views, sorted ascending.
    snapshots: Vec<u64>,
    /// True when this rewrite includes the oldest data for the range,
    /// allowing trailing tombstones to be dropped.
    drop_tombstones: bool,
    pending: VecDeque<Statement>,
    lookahead: Option<Statement>,
    page_budget: usize,
    page_used: usize,
}

impl WriteIterator {
    pub fn new(
        merge: MergeIterator,
        upsert: UpsertFn,
        mut snapshots: Vec<u64>,
        drop_tombstones: bool,
        page_budget: usize,
    ) -> Self {
        snapshots.sort_unstable();
        snapshots.dedup();
        Self {
            merge,
            upsert,
            snapshots,
            drop_tombstones,
            pending: VecDeque::new(),
            lookahead: None,
            page_budget,
            page_used: 0,
        }
    }

    pub fn page_full(&self) -> bool {
        self.page_used >= self.page_budget
    }

    pub fn begin_page(&mut self) {
        self.page_used = 0;
    }

    fn pull(&mut self) -> Option<Result<Statement>> {
        if let Some(stmt) = self.lookahead.take() {
            return Some(Ok(stmt));
        }
        self.merge.next()
    }

    /// Gather every version of the next key, newest first.
    fn next_key_versions(&mut self) -> Result<Option<Vec<Statement>>> {
        let first = match self.pull() {
            Some(stmt) => stmt?,
            None => return Ok(None),
        };
        let key = first.key().to_vec();
        let mut versions = vec![first];
        loop {
            let stmt = match self.pull() {
                Some(stmt) => stmt?,
                None => break,
            };
            if stmt.key() != key.as_slice() {
                self.lookahead = Some(stmt);
                break;
            }
            versions.push(stmt);
        }
        Ok(Some(versions))
    }

    /// Partition index for a statement: the number of live snapshots
    /// strictly below its LSN. Statements in the same partition are
    /// indistinguishable to every snapshot and may collapse.
    fn partition(&self, lsn: u64) -> usize {
        self.snapshots.partition_point(|&s| s < lsn)
    }

    /// Collapse one partition's statements (newest first) to its net
    /// effect. Upserts fold into a base within the partition; a pure
    /// upsert run folds to a single upsert.
    fn collapse(&self, run: &[Statement]) -> Statement {
        debug_assert!(!run.is_empty());
        let newest = &run[0];
        if !newest.is_upsert() {
            // A replace or delete shadows the whole partition.
            return newest.clone();
        }

        let mut chain = vec![newest.value().to_vec()];
        let mut base: Option<Vec<u8>> = None;
        let mut saw_delete = false;
        for stmt in &run[1..] {
            if stmt.is_delete() {
                saw_delete = true;
                break;
            }
            if stmt.is_upsert() {
                chain.push(stmt.value().to_vec());
                continue;
            }
            base = Some(stmt.value().to_vec());
            break;
        }

        if base.is_none() && !saw_delete {
            // No base inside this partition: fold the upserts into one
            // upsert and leave resolution to older data.
            let mut iter = chain.iter().rev();
            let mut acc = iter.next().cloned().unwrap_or_default();
            for newer in iter {
                acc = (self.upsert)(Some(&acc), newer);
            }
            return Statement::Fold(FoldState {
                key: newest.key().to_vec(),
                value: acc,
                lsn: newest.lsn(),
                flags: DocFlags::UPSERT,
            });
        }

        let mut acc = base;
        for upsert in chain.iter().rev() {
            acc = Some((self.upsert)(acc.as_deref(), upsert));
        }
        Statement::Fold(FoldState {
            key: newest.key().to_vec(),
            value: acc.unwrap_or_default(),
            lsn: newest.lsn(),
            flags: 0,
        })
    }

    /// Reduce one key's version list to the statements that must
    /// survive the rewrite.
    fn reduce(&self, versions: Vec<Statement>) -> Vec<Statement> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < versions.len() {
            let part = self.partition(versions[i].lsn());
            let mut j = i + 1;
            while j < versions.len() && self.partition(versions[j].lsn()) == part {
                j += 1;
            }
            let collapsed = self.collapse(&versions[i..j]);
            let newest_partition = out.is_empty();
            // Older partitions with no snapshot in reach serve no
            // reader; their content is shadowed for current readers by
            // the newest partition.
            let needed = newest_partition || part < self.snapshots.len();
            if needed {
                out.push(collapsed);
            }
            i = j;
        }

        // Trailing tombstones shadow nothing once this rewrite covers
        // the oldest data for the range.
        if self.drop_tombstones {
            while out.last().is_some_and(|s| s.is_delete()) {
                out.pop();
            }
        }
        out
    }
}

impl Iterator for WriteIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stmt) = self.pending.pop_front() {
                self.page_used += stmt.size();
                return Some(Ok(stmt));
            }
            let versions = match self.next_key_versions() {
                Ok(Some(versions)) => versions,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            self.pending = Self::reduce(self, versions).into();
        }
    }
}
