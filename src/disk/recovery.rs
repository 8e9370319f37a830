//! Directory sweep: reconstructs the persistent state machine from
//! file names alone. The tree-level recovery decides what to do with
//! each stage; this module only classifies.

use std::path::Path;

use itertools::Itertools;

use crate::disk::DROP_MARKER;
use crate::error::Result;
use crate::vfs::Vfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStage {
    /// `.index`: committed, part of the tree.
    Committed,
    /// `.index.seal`: complete and durable, interrupted before commit.
    Sealed,
    /// `.index.incomplete`: interrupted mid-write, unusable.
    Incomplete,
    /// `.index.gc`: superseded, unlink was interrupted.
    Garbage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFile {
    pub node_id: u64,
    pub branch_id: u64,
    pub stage: BranchStage,
    pub name: String,
}

/// Everything recovery needs to know about an index directory.
#[derive(Debug, Default)]
pub struct Sweep {
    pub branches: Vec<BranchFile>,
    /// A drop marker means the whole index directory is condemned.
    pub dropped: bool,
}

impl Sweep {
    pub fn with_stage(&self, stage: BranchStage) -> impl Iterator<Item = &BranchFile> {
        self.branches.iter().filter(move |b| b.stage == stage)
    }
}

fn parse_name(name: &str) -> Option<BranchFile> {
    let (stage, stem) = if let Some(stem) = name.strip_suffix(".index.seal") {
        (BranchStage::Sealed, stem)
    } else if let Some(stem) = name.strip_suffix(".index.incomplete") {
        (BranchStage::Incomplete, stem)
    } else if let Some(stem) = name.strip_suffix(".index.gc") {
        (BranchStage::Garbage, stem)
    } else if let Some(stem) = name.strip_suffix(".index") {
        (BranchStage::Committed, stem)
    } else {
        return None;
    };
    let (node, branch) = stem.split_once('-')?;
    Some(BranchFile {
        node_id: node.parse().ok()?,
        branch_id: branch.parse().ok()?,
        stage,
        name: name.to_string(),
    })
}

/// List an index directory and classify every branch file, ordered by
/// (node, branch). Unrecognized names are ignored.
pub fn sweep(vfs: &dyn Vfs, dir: &Path) -> Result<Sweep> {
    let mut out = Sweep::default();
    for name in vfs.read_dir(dir)? {
        if name == DROP_MARKER {
            out.dropped = true;
            continue;
        }
        if let Some(file) = parse_name(&name) {
            out.branches.push(file);
        }
    }
    out.branches = out
        .branches
        .into_iter()
        .sorted_by_key(|b| (b.node_id, b.branch_id))
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    #[test]
    fn test_parse_stages() {
        let f = parse_name("0001-0002.index").unwrap();
        assert_eq!((f.node_id, f.branch_id), (1, 2));
        assert_eq!(f.stage, BranchStage::Committed);

        assert_eq!(
            parse_name("0003-0010.index.seal").unwrap().stage,
            BranchStage::Sealed
        );
        assert_eq!(
            parse_name("0003-0010.index.incomplete").unwrap().stage,
            BranchStage::Incomplete
        );
        assert_eq!(
            parse_name("0003-0010.index.gc").unwrap().stage,
            BranchStage::Garbage
        );
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse_name("drop").is_none());
        assert!(parse_name("0001.index").is_none());
        assert!(parse_name("a-b.index").is_none());
        assert!(parse_name("0001-0002.tmp").is_none());
    }

    #[test]
    fn test_sweep_orders_and_classifies() {
        let fs = MemFs::new();
        let dir = Path::new("/db/main");
        for name in [
            "0002-0005.index",
            "0001-0003.index",
            "0001-0004.index.seal",
            "0001-0002.index.gc",
            "0003-0009.index.incomplete",
            "notes.txt",
        ] {
            fs.write_all(&dir.join(name), b"x").unwrap();
        }

        let sweep = sweep(&fs, dir).expect("Sweep failed");
        assert!(!sweep.dropped);
        let ids: Vec<(u64, u64)> = sweep
            .branches
            .iter()
            .map(|b| (b.node_id, b.branch_id))
            .collect();
        assert_eq!(ids, vec![(1, 2), (1, 3), (1, 4), (2, 5), (3, 9)]);
        assert_eq!(sweep.with_stage(BranchStage::Committed).count(), 2);
        assert_eq!(sweep.with_stage(BranchStage::Sealed).count(), 1);
    }

    #[test]
    fn test_sweep_sees_drop_marker() {
        let fs = MemFs::new();
        let dir = Path::new("/db/doomed");
        fs.write_all(&dir.join("drop"), b"").unwrap();
        fs.write_all(&dir.join("0001-0001.index"), b"x").unwrap();

        let sweep = sweep(&fs, dir).expect("Sweep failed");
        assert!(sweep.dropped);
        assert_eq!(sweep.branches.len(), 1);
    }
}
