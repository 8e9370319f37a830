//! Task execution: flushing memory generations into branches, merging
//! branches, splitting overgrown nodes, and collecting superseded
//! files.
//!
//! Crash consistency never relies on a journal. Every output goes
//! through `.incomplete` -> `.seal` -> `.index` renames; inputs are
//! only queued for deletion after all outputs are committed. Recovery
//! tolerates the in-between states: duplicate statements across
//! committed branches are suppressed by the merge iterator, and a seal
//! whose LSN range overlaps committed branches of its node is discarded
//! because its inputs are still authoritative.

use std::sync::Arc;

use tracing::{info, warn};

use crate::disk::{self, Branch, BranchBuilder, BranchStage};
use crate::document::DocFlags;
use crate::error::Result;
use crate::iterator::{MergeIterator, StmtSource, WriteIterator};
use crate::memindex::{MemIndex, Order};
use crate::statement::{DiskEntry, Statement};
use crate::tree::{LsmTree, Node, Task, TaskKind};
use crate::vfs::Vfs;

/// Run one planned task. `snapshots` are the read views of live
/// transactions; every rewrite must preserve what they observe.
pub fn execute(task: &Task, snapshots: &[u64]) -> Result<()> {
    match &task.kind {
        TaskKind::Branch | TaskKind::Lru | TaskKind::Age | TaskKind::Checkpoint => {
            let node = task.node.as_ref().expect("flush task carries a node");
            flush(&task.tree, node, snapshots)
        }
        TaskKind::Compact { branch_ids } => {
            let node = task.node.as_ref().expect("compact task carries a node");
            compact(&task.tree, node, branch_ids, snapshots)
        }
        TaskKind::Gc => collect_garbage(&task.tree),
        TaskKind::Drop => task.tree.purge(),
    }
}

fn to_entry(stmt: &Statement) -> DiskEntry {
    DiskEntry {
        key: stmt.key().to_vec(),
        value: stmt.value().to_vec(),
        lsn: stmt.lsn(),
        flags: stmt.flags() & (DocFlags::DELETE | DocFlags::UPSERT),
    }
}

/// Write a node's rotated generation into a new branch.
pub fn flush(tree: &Arc<LsmTree>, node: &Arc<Node>, snapshots: &[u64]) -> Result<()> {
    let Some(generation) = node.flush_source(tree.quota()) else {
        return Ok(());
    };
    let docs = generation.collect();
    if docs.is_empty() {
        node.discard_rotation();
        return Ok(());
    }

    let source: StmtSource = Box::new(docs.into_iter().map(|d| Ok(Statement::Mem(d))));
    let merge = MergeIterator::new(vec![source], Order::Asc)?;
    let mut iter = WriteIterator::new(
        merge,
        Arc::clone(&tree.scheme().upsert),
        snapshots.to_vec(),
        false,
        tree.config().page_size,
    );

    let branch_id = tree.sequence().next_branch_id();
    let filter_bits = tree.config().amqf.then_some(tree.config().filter_bits);
    let mut builder = BranchBuilder::new(
        Arc::clone(tree.vfs()),
        tree.dir(),
        node.id(),
        branch_id,
        tree.config().compression,
        filter_bits,
    )?;
    if let Err(e) = drive(&mut iter, &mut builder) {
        builder.abandon()?;
        return Err(e);
    }
    if builder.is_empty() {
        // Every statement folded away; the generation still retires.
        builder.abandon()?;
        node.discard_rotation();
        return Ok(());
    }
    builder.seal()?;
    let branch = Branch::commit_seal(tree.vfs().as_ref(), tree.dir(), node.id(), branch_id)?;
    info!(
        index = %tree.name(),
        node = node.id(),
        branch = branch_id,
        entries = branch.entry_count(),
        "flushed branch"
    );
    node.complete_branch(branch);
    Ok(())
}

fn drive(iter: &mut WriteIterator, builder: &mut BranchBuilder) -> Result<()> {
    while let Some(stmt) = iter.next() {
        builder.add(to_entry(&stmt?));
        if iter.page_full() {
            builder.end_page()?;
            iter.begin_page();
        }
    }
    Ok(())
}

/// Merge a node's branches into one rewritten run. When the result
/// outgrows the node size target, the output is cut at key boundaries
/// and the node splits into one successor per output branch.
pub fn compact(
    tree: &Arc<LsmTree>,
    node: &Arc<Node>,
    branch_ids: &[u64],
    snapshots: &[u64],
) -> Result<()> {
    let inputs: Vec<Arc<Branch>> = node
        .branches()
        .into_iter()
        .filter(|b| branch_ids.contains(&b.id()))
        .collect();
    if inputs.len() < 2 {
        return Ok(());
    }
    // Tombstones may be dropped only when nothing older than the
    // inputs remains in the node.
    let drop_tombstones = inputs.len() == node.branch_count();

    let sources: Vec<StmtSource> = inputs
        .iter()
        .map(|b| {
            let cursor = b.cursor(Arc::clone(tree.vfs()), true, None);
            Box::new(cursor.map(|r| r.map(Statement::Disk))) as StmtSource
        })
        .collect();
    let merge = MergeIterator::new(sources, Order::Asc)?;
    let mut iter = WriteIterator::new(
        merge,
        Arc::clone(&tree.scheme().upsert),
        snapshots.to_vec(),
        drop_tombstones,
        tree.config().page_size,
    );

    let filter_bits = tree.config().amqf.then_some(tree.config().filter_bits);
    let node_size = tree.config().node_size;
    // (node_id, branch_id) per sealed output; the first output keeps
    // the compacted node's identity.
    let mut outputs: Vec<(u64, u64)> = Vec::new();
    let mut builder: Option<BranchBuilder> = None;
    let mut bytes_out = 0usize;
    let mut last_key: Vec<u8> = Vec::new();

    let result = (|| -> Result<()> {
        while let Some(stmt) = iter.next() {
            let stmt = stmt?;
            let entry = to_entry(&stmt);
            // Cut the output only between keys so a version chain never
            // spans two nodes.
            if bytes_out >= node_size && entry.key != last_key {
                if let Some(b) = builder.take() {
                    b.seal()?;
                }
                bytes_out = 0;
            }
            if builder.is_none() {
                let node_id = if outputs.is_empty() {
                    node.id()
                } else {
                    tree.sequence().next_node_id()
                };
                let branch_id = tree.sequence().next_branch_id();
                outputs.push((node_id, branch_id));
                builder = Some(BranchBuilder::new(
                    Arc::clone(tree.vfs()),
                    tree.dir(),
                    node_id,
                    branch_id,
                    tree.config().compression,
                    filter_bits,
                )?);
            }
            let b = builder.as_mut().expect("output builder exists");
            bytes_out += entry.key.len() + entry.value.len();
            last_key = entry.key.clone();
            b.add(entry);
            if iter.page_full() {
                b.end_page()?;
                iter.begin_page();
            }
        }
        if let Some(b) = builder.take() {
            b.seal()?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        if let Some(b) = builder.take() {
            b.abandon()?;
        }
        return Err(e);
    }

    // Commit every output before touching the inputs.
    let mut committed = Vec::with_capacity(outputs.len());
    for (node_id, branch_id) in &outputs {
        committed.push(Branch::commit_seal(
            tree.vfs().as_ref(),
            tree.dir(),
            *node_id,
            *branch_id,
        )?);
    }

    info!(
        index = %tree.name(),
        node = node.id(),
        inputs = inputs.len(),
        outputs = committed.len(),
        "compacted"
    );

    match committed.len() {
        0 => node.replace_branches(branch_ids, None),
        1 => node.replace_branches(branch_ids, Some(committed.pop().expect("one output"))),
        _ => split(tree, node, branch_ids, committed),
    }
    tree.defer_gc(inputs);
    Ok(())
}

/// Replace `node` with one successor per output branch. The retired
/// node's memory is partitioned among the successors before they are
/// published, so a reader routed to a successor never misses a
/// committed in-memory document and the swap is one atomic step.
fn split(tree: &Arc<LsmTree>, node: &Arc<Node>, compacted_ids: &[u64], outputs: Vec<Arc<Branch>>) {
    let leftover: Vec<Arc<Branch>> = node
        .branches()
        .into_iter()
        .filter(|b| !compacted_ids.contains(&b.id()))
        .collect();

    let mut successors = Vec::with_capacity(outputs.len());
    for branch in outputs {
        let first_key = branch.first_key().unwrap_or_default().to_vec();
        let node_id = branch.node_id();
        // Branches flushed between planning and commit span the old
        // range, so every successor keeps a reference to them.
        let branches: Vec<Arc<Branch>> =
            leftover.iter().cloned().chain(std::iter::once(branch)).collect();
        successors.push(Node::with_branches(node_id, first_key, branches, tree.quota()));
    }

    // Freeze writes to the old node; racing writers spin in `tree.set`
    // until the successors are published below. The generations stay
    // readable through the old node for the whole hand-off.
    let (i0, i1) = node.retire();

    // Partition the frozen memory by successor range. `adopt` reuses
    // the quota bytes the donors already hold; `forget_quota` hands
    // the reservation over once every entry has moved.
    let bounds: Vec<Vec<u8>> = successors
        .iter()
        .skip(1)
        .map(|s| s.first_key().to_vec())
        .collect();
    let inherited: Vec<Arc<MemIndex>> = successors
        .iter()
        .map(|_| Arc::new(MemIndex::new(Arc::clone(tree.quota()))))
        .collect();
    for generation in [Some(&i0), i1.as_ref()].into_iter().flatten() {
        for doc in generation.collect() {
            let slot = bounds.partition_point(|b| b.as_slice() <= doc.key());
            inherited[slot].adopt(doc);
        }
    }
    for (successor, generation) in successors.iter().zip(inherited) {
        if !generation.is_empty() {
            successor.inherit_memory(generation);
        }
    }
    i0.forget_quota();
    if let Some(i1) = &i1 {
        i1.forget_quota();
    }

    tree.install_split(node, successors);
    info!(index = %tree.name(), node = node.id(), parts = tree.node_count(), "split node");
}

/// Unlink superseded and abandoned branch files.
pub fn collect_garbage(tree: &Arc<LsmTree>) -> Result<()> {
    let vfs = tree.vfs();
    for branch in tree.take_collectable() {
        let gc = disk::gc_path(tree.dir(), branch.node_id(), branch.id());
        if let Err(e) = vfs.rename(branch.path(), &gc).and_then(|_| vfs.unlink(&gc)) {
            warn!(path = %branch.path().display(), error = %e, "gc unlink failed");
        }
    }
    // Stray files from interrupted builds.
    let sweep = disk::sweep(vfs.as_ref(), tree.dir())?;
    for file in sweep.branches {
        if matches!(file.stage, BranchStage::Garbage | BranchStage::Incomplete) {
            if let Err(e) = vfs.unlink(&tree.dir().join(&file.name)) {
                warn!(file = %file.name, error = %e, "gc unlink failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::document::{Document, Scheme, Sequence};
    use crate::quota::Quota;
    use crate::vfs::MemFs;
    use std::path::Path;

    fn tree_with(config: IndexConfig) -> Arc<LsmTree> {
        let vfs: Arc<dyn Vfs> = Arc::new(MemFs::new());
        LsmTree::create(
            vfs,
            Path::new("/db"),
            config,
            Scheme::replacing(),
            Arc::new(Sequence::new()),
            Arc::new(Quota::new(64 * 1024 * 1024)),
        )
        .expect("Tree creation failed")
    }

    fn tree() -> Arc<LsmTree> {
        tree_with(IndexConfig::new("t"))
    }

    fn doc(key: &str, value: &str, lsn: u64) -> Arc<Document> {
        Document::new(key.into(), value.into(), lsn, 0)
    }

    fn flush_node(tree: &Arc<LsmTree>) {
        let node = tree.node_for(b"");
        flush(tree, &node, &[]).expect("Flush failed");
    }

    #[test]
    fn test_flush_and_read_back() {
        let tree = tree();
        for i in 0..50u64 {
            tree.set(doc(&format!("key-{:03}", i), &format!("v{}", i), i + 1))
                .unwrap();
        }
        flush_node(&tree);

        let node = tree.node_for(b"");
        assert_eq!(node.branch_count(), 1);
        assert_eq!(node.mem_bytes(), 0, "Flush must release the generation");
        assert_eq!(
            tree.get(b"key-017", u64::MAX).unwrap().unwrap().value(),
            b"v17"
        );
    }

    #[test]
    fn test_flush_empty_node_is_noop() {
        let tree = tree();
        flush_node(&tree);
        assert_eq!(tree.node_for(b"").branch_count(), 0);
    }

    #[test]
    fn test_flush_keeps_only_newest_version() {
        let tree = tree();
        for lsn in 1..=5u64 {
            tree.set(doc("k", &format!("v{}", lsn), lsn)).unwrap();
        }
        flush_node(&tree);

        let node = tree.node_for(b"");
        let branch = &node.branches()[0];
        assert_eq!(branch.entry_count(), 1, "Shadowed versions must fold away");
        assert_eq!(tree.get(b"k", u64::MAX).unwrap().unwrap().value(), b"v5");
    }

    #[test]
    fn test_flush_preserves_snapshot_versions() {
        let tree = tree();
        tree.set(doc("k", "old", 2)).unwrap();
        tree.set(doc("k", "new", 8)).unwrap();
        let node = tree.node_for(b"");
        flush(&tree, &node, &[4]).expect("Flush failed");

        assert_eq!(node.branches()[0].entry_count(), 2);
        assert_eq!(tree.get(b"k", 4).unwrap().unwrap().value(), b"old");
        assert_eq!(tree.get(b"k", u64::MAX).unwrap().unwrap().value(), b"new");
    }

    #[test]
    fn test_compaction_merges_branches() {
        let tree = tree();
        for round in 0..3u64 {
            for i in 0..10u64 {
                let lsn = round * 10 + i + 1;
                tree.set(doc(&format!("key-{}", i), &format!("r{}", round), lsn))
                    .unwrap();
            }
            flush_node(&tree);
        }
        let node = tree.node_for(b"");
        assert_eq!(node.branch_count(), 3);

        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[]).expect("Compaction failed");

        assert_eq!(node.branch_count(), 1);
        let merged = &node.branches()[0];
        assert_eq!(merged.entry_count(), 10, "One surviving version per key");
        for i in 0..10u64 {
            assert_eq!(
                tree.get(format!("key-{}", i).as_bytes(), u64::MAX)
                    .unwrap()
                    .unwrap()
                    .value(),
                b"r2"
            );
        }
    }

    #[test]
    fn test_compaction_drops_tombstones_at_bottom() {
        let tree = tree();
        tree.set(doc("keep", "v", 1)).unwrap();
        tree.set(doc("gone", "v", 2)).unwrap();
        flush_node(&tree);
        tree.set(Document::tombstone(b"gone".to_vec(), 3)).unwrap();
        flush_node(&tree);

        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[]).unwrap();

        let merged = &node.branches()[0];
        assert_eq!(merged.entry_count(), 1, "Tombstone and victim must vanish");
        assert!(tree.get(b"gone", u64::MAX).unwrap().is_none());
        assert_eq!(tree.get(b"keep", u64::MAX).unwrap().unwrap().value(), b"v");
    }

    #[test]
    fn test_compaction_is_transparent_to_snapshots() {
        let tree = tree();
        tree.set(doc("k", "old", 2)).unwrap();
        flush_node(&tree);
        tree.set(doc("k", "new", 8)).unwrap();
        flush_node(&tree);

        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        // A transaction at read view 5 is still live.
        compact(&tree, &node, &ids, &[5]).unwrap();

        assert_eq!(tree.get(b"k", 5).unwrap().unwrap().value(), b"old");
        assert_eq!(tree.get(b"k", u64::MAX).unwrap().unwrap().value(), b"new");
    }

    #[test]
    fn test_compaction_splits_oversized_node() {
        // Tiny node size so two flushes force a split.
        let tree = tree_with(IndexConfig::new("t").node_size(2048).page_size(512));
        for i in 0..64u64 {
            tree.set(doc(
                &format!("key-{:03}", i),
                &"x".repeat(100),
                i + 1,
            ))
            .unwrap();
        }
        flush_node(&tree);
        for i in 64..128u64 {
            tree.set(doc(
                &format!("key-{:03}", i),
                &"x".repeat(100),
                i + 1,
            ))
            .unwrap();
        }
        flush_node(&tree);

        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[]).unwrap();

        assert!(tree.node_count() > 1, "Node must split");
        // Every key still readable, routed to the right successor.
        for i in 0..128u64 {
            let key = format!("key-{:03}", i);
            assert!(
                tree.get(key.as_bytes(), u64::MAX).unwrap().is_some(),
                "Lost {} after split",
                key
            );
        }
        // New writes route to successors.
        tree.set(doc("key-0005", "rewritten", 1000)).unwrap();
        assert_eq!(
            tree.get(b"key-0005", u64::MAX).unwrap().unwrap().value(),
            b"rewritten"
        );
    }

    /// Writes that land in the node's memory while its branches are
    /// being compacted must be readable from the successors the moment
    /// the split is published, and the quota bytes they hold must move
    /// with them.
    #[test]
    fn test_split_carries_node_memory_into_successors() {
        let tree = tree_with(IndexConfig::new("t").node_size(2048).page_size(512));
        for i in 0..64u64 {
            tree.set(doc(&format!("key-{:03}", i), &"x".repeat(100), i + 1))
                .unwrap();
        }
        flush_node(&tree);
        for i in 64..128u64 {
            tree.set(doc(&format!("key-{:03}", i), &"x".repeat(100), i + 1))
                .unwrap();
        }
        flush_node(&tree);

        // Commits that arrive while the compaction runs sit in memory;
        // the compaction inputs know nothing about them.
        for i in (0..128u64).step_by(7) {
            tree.set(doc(&format!("key-{:03}", i), "fresh", 500 + i))
                .unwrap();
        }
        let pinned = tree.quota().used();
        assert!(pinned > 0);

        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[]).unwrap();
        assert!(tree.node_count() > 1, "Node must split");

        for i in 0..128u64 {
            let key = format!("key-{:03}", i);
            let got = tree.get(key.as_bytes(), u64::MAX).unwrap().unwrap();
            if i % 7 == 0 {
                assert_eq!(got.value(), b"fresh", "Memory write to {} lost", key);
            } else {
                assert_eq!(got.value(), "x".repeat(100).as_bytes());
            }
        }
        // The reservation changed hands exactly once.
        assert_eq!(tree.quota().used(), pinned, "Split must not leak quota");
        assert_eq!(tree.mem_bytes(), pinned);
    }

    #[test]
    fn test_gc_unlinks_superseded_branches() {
        let tree = tree();
        for round in 0..2u64 {
            tree.set(doc("k", &format!("v{}", round), round + 1)).unwrap();
            flush_node(&tree);
        }
        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        let old_paths: Vec<_> = node.branches().iter().map(|b| b.path().to_path_buf()).collect();
        compact(&tree, &node, &ids, &[]).unwrap();

        // Inputs still on disk until gc runs.
        assert!(old_paths.iter().all(|p| tree.vfs().exists(p)));
        collect_garbage(&tree).expect("Gc failed");
        assert!(old_paths.iter().all(|p| !tree.vfs().exists(p)));
        assert_eq!(tree.get(b"k", u64::MAX).unwrap().unwrap().value(), b"v1");
    }

    /// End-to-end churn: write a thousand keys, flush, delete them all,
    /// flush, compact. The data must be gone and the files shrunken.
    #[test]
    fn test_write_delete_compact_churn() {
        let tree = tree();
        let mut lsn = 0u64;
        for i in 0..1000u64 {
            lsn += 1;
            tree.set(doc(&format!("key-{:04}", i), &format!("value-{}", i), lsn))
                .unwrap();
        }
        flush_node(&tree);
        for i in 0..1000u64 {
            lsn += 1;
            tree.set(Document::tombstone(format!("key-{:04}", i).into_bytes(), lsn))
                .unwrap();
        }
        flush_node(&tree);

        let node = tree.node_for(b"");
        assert_eq!(node.branch_count(), 2);
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[]).unwrap();
        collect_garbage(&tree).unwrap();

        assert_eq!(node.branch_count(), 0, "Everything annihilated");
        for i in (0..1000u64).step_by(97) {
            assert!(tree
                .get(format!("key-{:04}", i).as_bytes(), u64::MAX)
                .unwrap()
                .is_none());
        }
        let empty: Vec<_> = tree
            .cursor(Order::Asc, None, u64::MAX)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(empty.is_empty());
    }

    /// Same churn, but a read view at the pre-delete LSN stays live:
    /// the rewrite must keep both the original values and the
    /// tombstones that hide them from newer views.
    #[test]
    fn test_churn_preserves_live_snapshot() {
        let tree = tree();
        for i in 0..1000u64 {
            tree.set(doc(&format!("key-{:04}", i), &format!("value-{}", i), i + 1))
                .unwrap();
        }
        flush_node(&tree);
        for i in 0..1000u64 {
            tree.set(Document::tombstone(
                format!("key-{:04}", i).into_bytes(),
                1001 + i,
            ))
            .unwrap();
        }
        flush_node(&tree);

        let node = tree.node_for(b"");
        let ids: Vec<u64> = node.branches().iter().map(|b| b.id()).collect();
        compact(&tree, &node, &ids, &[1000]).unwrap();

        for i in (0..1000u64).step_by(113) {
            let key = format!("key-{:04}", i);
            assert_eq!(
                tree.get(key.as_bytes(), 1000).unwrap().unwrap().value(),
                format!("value-{}", i).as_bytes(),
                "Snapshot at 1000 lost {}",
                key
            );
            assert!(
                tree.get(key.as_bytes(), 2000).unwrap().is_none(),
                "Delete of {} must stay visible at 2000",
                key
            );
        }
    }
}
