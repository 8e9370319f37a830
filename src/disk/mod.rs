//! On-disk layout.
//!
//! Each index lives in its own directory. A branch is one immutable
//! file of checksummed pages with a footer index; its life cycle is
//! carried entirely by the file name:
//!
//! ```text
//!   <node>-<branch>.index.incomplete   being written
//!   <node>-<branch>.index.seal         complete, not yet committed
//!   <node>-<branch>.index              committed
//!   <node>-<branch>.index.gc           superseded, pending unlink
//!   drop                               the whole index is being dropped
//! ```
//!
//! Recovery never reads a journal: the directory listing plus the
//! footer checksums are the entire persistent state machine.

pub mod branch;
pub mod page;
pub mod recovery;

pub use branch::{Branch, BranchBuilder, BranchCursor};
pub use page::{Page, PageBuilder, PageMeta};
pub use recovery::{sweep, BranchFile, BranchStage, Sweep};

use std::path::{Path, PathBuf};

/// Name of the drop marker file inside an index directory.
pub const DROP_MARKER: &str = "drop";

const SUFFIX_COMMITTED: &str = ".index";
const SUFFIX_SEAL: &str = ".index.seal";
const SUFFIX_INCOMPLETE: &str = ".index.incomplete";
const SUFFIX_GC: &str = ".index.gc";

/// Path of a committed branch file.
pub fn branch_path(dir: &Path, node_id: u64, branch_id: u64) -> PathBuf {
    dir.join(format!("{:04}-{:04}{}", node_id, branch_id, SUFFIX_COMMITTED))
}

pub fn seal_path(dir: &Path, node_id: u64, branch_id: u64) -> PathBuf {
    dir.join(format!("{:04}-{:04}{}", node_id, branch_id, SUFFIX_SEAL))
}

pub fn incomplete_path(dir: &Path, node_id: u64, branch_id: u64) -> PathBuf {
    dir.join(format!(
        "{:04}-{:04}{}",
        node_id, branch_id, SUFFIX_INCOMPLETE
    ))
}

pub fn gc_path(dir: &Path, node_id: u64, branch_id: u64) -> PathBuf {
    dir.join(format!("{:04}-{:04}{}", node_id, branch_id, SUFFIX_GC))
}
