//! Journal-free recovery: the index directory is rebuilt from file
//! names and branch footers alone.
//!
//! Rules, applied in order:
//!
//!   1. A drop marker condemns the whole directory.
//!   2. `.incomplete` and `.gc` files are deleted.
//!   3. A `.seal` whose LSN range overlaps a committed branch of the
//!      same node is a compaction output whose inputs survived; it is
//!      discarded and the compaction redone later. Any other seal is
//!      rolled forward to committed.
//!   4. Committed branches group into nodes by the node id in their
//!      footer. Nodes whose key ranges overlap (a split interrupted
//!      mid-commit) coalesce into one node; a later compaction
//!      re-splits them.
//!
//! Duplicate statements left by an interrupted compaction are harmless:
//! the merge iterator suppresses exact (key, lsn) duplicates and the
//! next rewrite removes them from disk.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::disk::{self, Branch, BranchStage};
use crate::document::{Scheme, Sequence};
use crate::error::Result;
use crate::quota::Quota;
use crate::tree::{LsmTree, Node};
use crate::vfs::Vfs;

/// Open an index directory, recovering whatever state a crash left
/// behind, or create it fresh.
pub fn open(
    vfs: Arc<dyn Vfs>,
    root: &Path,
    config: IndexConfig,
    scheme: Scheme,
    seq: Arc<Sequence>,
    quota: Arc<Quota>,
) -> Result<Arc<LsmTree>> {
    config.validate()?;
    let dir = root.join(&config.name);
    if !vfs.exists(&dir) {
        return LsmTree::create(vfs, root, config, scheme, seq, quota);
    }

    let sweep = disk::sweep(vfs.as_ref(), &dir)?;
    if sweep.dropped {
        // An interrupted drop finishes now.
        info!(index = %config.name, "completing interrupted drop");
        for name in vfs.read_dir(&dir)? {
            vfs.unlink(&dir.join(name))?;
        }
        return LsmTree::create(vfs, root, config, scheme, seq, quota);
    }

    for file in sweep.with_stage(BranchStage::Incomplete) {
        warn!(index = %config.name, file = %file.name, "discarding incomplete branch");
        vfs.unlink(&dir.join(&file.name))?;
    }
    for file in sweep.with_stage(BranchStage::Garbage) {
        vfs.unlink(&dir.join(&file.name))?;
    }

    let mut branches: Vec<Arc<Branch>> = Vec::new();
    for file in sweep.with_stage(BranchStage::Committed) {
        branches.push(Branch::open(vfs.as_ref(), &dir.join(&file.name))?);
    }

    for file in sweep.with_stage(BranchStage::Sealed) {
        let sealed = Branch::open(vfs.as_ref(), &dir.join(&file.name))?;
        let overlaps = branches.iter().any(|b| {
            b.node_id() == sealed.node_id()
                && b.min_lsn() <= sealed.max_lsn()
                && sealed.min_lsn() <= b.max_lsn()
        });
        if overlaps {
            warn!(index = %config.name, file = %file.name, "discarding superseded seal");
            vfs.unlink(&dir.join(&file.name))?;
            continue;
        }
        info!(index = %config.name, file = %file.name, "rolling sealed branch forward");
        branches.push(Branch::commit_seal(
            vfs.as_ref(),
            &dir,
            file.node_id,
            file.branch_id,
        )?);
    }

    // Fast-forward the id and LSN counters past everything on disk.
    for branch in &branches {
        seq.observe_node_id(branch.node_id());
        seq.observe_branch_id(branch.id());
        seq.observe_lsn(branch.max_lsn());
    }

    let nodes = assemble_nodes(branches, &quota, &seq);
    info!(
        index = %config.name,
        nodes = nodes.len(),
        "recovered index"
    );
    Ok(LsmTree::assemble(vfs, dir, config, scheme, seq, quota, nodes))
}

/// Group branches into nodes and coalesce overlapping key ranges.
fn assemble_nodes(
    branches: Vec<Arc<Branch>>,
    quota: &Arc<Quota>,
    seq: &Arc<Sequence>,
) -> Vec<Arc<Node>> {
    if branches.is_empty() {
        return vec![Node::new(seq.next_node_id(), Vec::new(), quota)];
    }

    let mut groups: BTreeMap<u64, Vec<Arc<Branch>>> = BTreeMap::new();
    for branch in branches {
        groups.entry(branch.node_id()).or_default().push(branch);
    }

    struct Group {
        node_id: u64,
        first_key: Vec<u8>,
        last_key: Vec<u8>,
        branches: Vec<Arc<Branch>>,
    }
    let mut spans: Vec<Group> = groups
        .into_iter()
        .map(|(node_id, branches)| Group {
            node_id,
            first_key: branches
                .iter()
                .filter_map(|b| b.first_key())
                .min()
                .unwrap_or_default()
                .to_vec(),
            last_key: branches
                .iter()
                .filter_map(|b| b.last_key())
                .max()
                .unwrap_or_default()
                .to_vec(),
            branches,
        })
        .sorted_by(|a, b| a.first_key.cmp(&b.first_key))
        .collect();

    // Interval merge over key ranges.
    let mut merged: Vec<Group> = Vec::new();
    for group in spans.drain(..) {
        match merged.last_mut() {
            Some(last) if group.first_key <= last.last_key => {
                last.last_key = last.last_key.clone().max(group.last_key);
                last.branches.extend(group.branches);
            }
            _ => merged.push(group),
        }
    }

    merged
        .into_iter()
        .map(|mut group| {
            // Newest first within the node.
            group
                .branches
                .sort_by_key(|b| (std::cmp::Reverse(b.max_lsn()), std::cmp::Reverse(b.id())));
            Node::with_branches(group.node_id, group.first_key, group.branches, quota)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::disk::BranchBuilder;
    use crate::document::Document;
    use crate::memindex::Order;
    use crate::statement::DiskEntry;
    use crate::tree::compact;
    use crate::vfs::MemFs;

    fn deps() -> (Arc<dyn Vfs>, Arc<Sequence>, Arc<Quota>) {
        (
            Arc::new(MemFs::new()),
            Arc::new(Sequence::new()),
            Arc::new(Quota::new(64 * 1024 * 1024)),
        )
    }

    fn reopen(vfs: &Arc<dyn Vfs>) -> Arc<LsmTree> {
        open(
            Arc::clone(vfs),
            Path::new("/db"),
            IndexConfig::new("t"),
            Scheme::replacing(),
            Arc::new(Sequence::new()),
            Arc::new(Quota::new(64 * 1024 * 1024)),
        )
        .expect("Recovery failed")
    }

    fn populate(vfs: &Arc<dyn Vfs>, seq: &Arc<Sequence>, quota: &Arc<Quota>) -> Arc<LsmTree> {
        let tree = open(
            Arc::clone(vfs),
            Path::new("/db"),
            IndexConfig::new("t"),
            Scheme::replacing(),
            Arc::clone(seq),
            Arc::clone(quota),
        )
        .expect("Open failed");
        for i in 0..20u64 {
            let lsn = seq.next_lsn();
            tree.set(Document::new(
                format!("key-{:02}", i).into_bytes(),
                format!("v{}", i).into_bytes(),
                lsn,
                0,
            ))
            .unwrap();
        }
        let node = tree.node_for(b"");
        compact::flush(&tree, &node, &[]).expect("Flush failed");
        tree
    }

    #[test]
    fn test_recover_committed_branches() {
        let (vfs, seq, quota) = deps();
        populate(&vfs, &seq, &quota);

        let recovered = reopen(&vfs);
        assert_eq!(recovered.node_count(), 1);
        assert_eq!(
            recovered.get(b"key-07", u64::MAX).unwrap().unwrap().value(),
            b"v7"
        );
        let keys: Vec<_> = recovered
            .cursor(Order::Asc, None, u64::MAX)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys.len(), 20);
    }

    #[test]
    fn test_counters_fast_forwarded() {
        let (vfs, seq, quota) = deps();
        populate(&vfs, &seq, &quota);
        let high_water = seq.current_lsn();

        let fresh_seq = Arc::new(Sequence::new());
        let recovered = open(
            Arc::clone(&vfs),
            Path::new("/db"),
            IndexConfig::new("t"),
            Scheme::replacing(),
            Arc::clone(&fresh_seq),
            Arc::new(Quota::new(64 * 1024 * 1024)),
        )
        .unwrap();
        assert!(fresh_seq.current_lsn() >= high_water);
        // New writes never reuse an LSN.
        assert!(fresh_seq.next_lsn() > high_water);
        drop(recovered);
    }

    #[test]
    fn test_seal_rolls_forward() {
        let (vfs, _seq, _quota) = deps();
        let dir = Path::new("/db/t");
        vfs.mkdir_all(dir).unwrap();
        let mut builder =
            BranchBuilder::new(Arc::clone(&vfs), dir, 1, 1, Compression::None, None).unwrap();
        builder.add(DiskEntry {
            key: b"k".to_vec(),
            value: b"sealed".to_vec(),
            lsn: 5,
            flags: 0,
        });
        builder.seal().expect("Seal failed");

        let recovered = reopen(&vfs);
        assert_eq!(
            recovered.get(b"k", u64::MAX).unwrap().unwrap().value(),
            b"sealed"
        );
        assert!(vfs.exists(&disk::branch_path(dir, 1, 1)));
        assert!(!vfs.exists(&disk::seal_path(dir, 1, 1)));
    }

    #[test]
    fn test_overlapping_seal_discarded() {
        let (vfs, seq, quota) = deps();
        let tree = populate(&vfs, &seq, &quota);
        let dir = tree.dir().to_path_buf();
        let node_id = tree.node_for(b"").id();

        // A compaction output sealed but not committed: same node, an
        // LSN range covered by the committed branch.
        let mut builder =
            BranchBuilder::new(Arc::clone(&vfs), &dir, node_id, 99, Compression::None, None)
                .unwrap();
        builder.add(DiskEntry {
            key: b"key-00".to_vec(),
            value: b"stale".to_vec(),
            lsn: 1,
            flags: 0,
        });
        builder.seal().unwrap();
        drop(tree);

        let recovered = reopen(&vfs);
        assert!(!vfs.exists(&disk::seal_path(&dir, node_id, 99)));
        assert!(!vfs.exists(&disk::branch_path(&dir, node_id, 99)));
        assert_eq!(
            recovered.get(b"key-00", u64::MAX).unwrap().unwrap().value(),
            b"v0"
        );
    }

    #[test]
    fn test_incomplete_and_gc_files_removed() {
        let (vfs, seq, quota) = deps();
        let tree = populate(&vfs, &seq, &quota);
        let dir = tree.dir().to_path_buf();
        drop(tree);
        vfs.write_all(&dir.join("0009-0009.index.incomplete"), b"junk")
            .unwrap();
        vfs.write_all(&dir.join("0008-0008.index.gc"), b"junk").unwrap();

        reopen(&vfs);
        assert!(!vfs.exists(&dir.join("0009-0009.index.incomplete")));
        assert!(!vfs.exists(&dir.join("0008-0008.index.gc")));
    }

    #[test]
    fn test_drop_marker_completes_drop() {
        let (vfs, seq, quota) = deps();
        let tree = populate(&vfs, &seq, &quota);
        tree.mark_dropped().unwrap();
        drop(tree);

        let recovered = reopen(&vfs);
        assert!(recovered.get(b"key-00", u64::MAX).unwrap().is_none());
        let empty: Vec<_> = recovered
            .cursor(Order::Asc, None, u64::MAX)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_overlapping_nodes_coalesce() {
        let (vfs, _seq, _quota) = deps();
        let dir = Path::new("/db/t");
        vfs.mkdir_all(dir).unwrap();
        // Two node ids whose ranges overlap, as an interrupted split
        // leaves behind.
        for (node_id, keys, lsn) in [
            (1u64, &["a", "m", "z"][..], 1u64),
            (2, &["m", "z"][..], 10),
        ] {
            let mut builder =
                BranchBuilder::new(Arc::clone(&vfs), dir, node_id, node_id, Compression::None, None)
                    .unwrap();
            for &key in keys {
                builder.add(DiskEntry {
                    key: key.into(),
                    value: format!("n{}", node_id).into_bytes(),
                    lsn,
                    flags: 0,
                });
            }
            builder.seal().unwrap();
            Branch::commit_seal(vfs.as_ref(), dir, node_id, node_id).unwrap();
        }

        let recovered = reopen(&vfs);
        assert_eq!(recovered.node_count(), 1, "Overlapping ranges coalesce");
        // The newer node's versions win inside the coalesced node.
        assert_eq!(
            recovered.get(b"m", u64::MAX).unwrap().unwrap().value(),
            b"n2"
        );
        assert_eq!(recovered.get(b"a", u64::MAX).unwrap().unwrap().value(), b"n1");
    }

    #[test]
    fn test_disjoint_nodes_stay_split() {
        let (vfs, _seq, _quota) = deps();
        let dir = Path::new("/db/t");
        vfs.mkdir_all(dir).unwrap();
        for (node_id, keys) in [(1u64, ["a", "f"]), (2, ["m", "z"])] {
            let mut builder =
                BranchBuilder::new(Arc::clone(&vfs), dir, node_id, node_id, Compression::None, None)
                    .unwrap();
            for key in keys {
                builder.add(DiskEntry {
                    key: key.into(),
                    value: b"v".to_vec(),
                    lsn: node_id,
                    flags: 0,
                });
            }
            builder.seal().unwrap();
            Branch::commit_seal(vfs.as_ref(), dir, node_id, node_id).unwrap();
        }

        let recovered = reopen(&vfs);
        assert_eq!(recovered.node_count(), 2);
        assert_eq!(recovered.node_for(b"b").id(), 1);
        assert_eq!(recovered.node_for(b"n").id(), 2);
    }
}
