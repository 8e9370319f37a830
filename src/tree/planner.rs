//! Task planning: turns tree state into at most one background task
//! per call.
//!
//! Priority order: checkpoint flushes, quota-pressure flushes, regular
//! branch flushes, compaction, age flushes, garbage collection. Zone
//! watermarks and concurrency limits come from the index config,
//! selected by the current quota-usage percentile, so the planner gets
//! more aggressive as memory fills. A planned task claims its node;
//! the claim is released when the scheduler completes the task.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{CompactMode, ZoneConfig};
use crate::tree::{LsmTree, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Flush a node's rotated generation into a new branch.
    Branch,
    /// Merge a node's branches; may split the node.
    Compact { branch_ids: Vec<u64> },
    /// Flush forced by quota pressure.
    Lru,
    /// Flush forced by generation age.
    Age,
    /// Flush forced by a periodic checkpoint.
    Checkpoint,
    /// Unlink superseded branch files.
    Gc,
    /// Delete a condemned index.
    Drop,
}

pub struct Task {
    pub kind: TaskKind,
    pub tree: Arc<LsmTree>,
    /// Claimed node; `Gc` and `Drop` run against the whole tree.
    pub node: Option<Arc<Node>>,
}

impl Task {
    pub fn is_flush(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Branch | TaskKind::Lru | TaskKind::Age | TaskKind::Checkpoint
        )
    }
}

/// Scheduler-supplied context for one planning pass over one tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanContext {
    pub quota_percent: u8,
    /// Periodic triggers that have fired since the last pass.
    pub checkpoint: bool,
    pub age: bool,
    pub gc: bool,
    /// Flush generations idle longer than this when `age` fires.
    pub age_after: Duration,
    /// Tasks of each class currently running against this tree.
    pub running_branches: usize,
    pub running_compacts: usize,
}

pub struct Planner;

impl Planner {
    /// Produce at most one task for `tree`. The returned task's node is
    /// already claimed.
    pub fn plan(tree: &Arc<LsmTree>, ctx: &PlanContext) -> Option<Task> {
        let zone = tree.config().zone_for(ctx.quota_percent).clone();
        let nodes = tree.nodes();

        if ctx.checkpoint {
            if let Some(task) = Self::plan_flush(tree, &nodes, TaskKind::Checkpoint, 1) {
                return Some(task);
            }
        }

        let may_flush = ctx.running_branches < zone.branch_limit;
        if may_flush && ctx.quota_percent >= zone.usage_percent && zone.usage_percent > 0 {
            // Under pressure: flush the node pinning the most memory.
            if let Some(task) = Self::plan_lru(tree, &nodes) {
                return Some(task);
            }
        }

        if may_flush {
            if let Some(task) = Self::plan_flush(tree, &nodes, TaskKind::Branch, zone.branch_watermark)
            {
                return Some(task);
            }
        }

        if ctx.running_compacts < zone.compact_limit {
            if let Some(task) = Self::plan_compact(tree, &nodes, &zone) {
                return Some(task);
            }
        }

        if ctx.age && may_flush {
            if let Some(task) = Self::plan_age(tree, &nodes, ctx.age_after) {
                return Some(task);
            }
        }

        if ctx.gc {
            return Some(Task {
                kind: TaskKind::Gc,
                tree: Arc::clone(tree),
                node: None,
            });
        }
        None
    }

    /// Flush any node whose active generation has reached `watermark`
    /// bytes.
    fn plan_flush(
        tree: &Arc<LsmTree>,
        nodes: &[Arc<Node>],
        kind: TaskKind,
        watermark: usize,
    ) -> Option<Task> {
        let node = nodes
            .iter()
            .filter(|n| n.i0_bytes() >= watermark || n.is_flushing())
            .find(|n| n.try_claim())?;
        debug!(index = %tree.name(), node = node.id(), ?kind, "planned flush");
        Some(Task {
            kind,
            tree: Arc::clone(tree),
            node: Some(Arc::clone(node)),
        })
    }

    fn plan_lru(tree: &Arc<LsmTree>, nodes: &[Arc<Node>]) -> Option<Task> {
        let node = nodes
            .iter()
            .filter(|n| n.mem_bytes() > 0)
            .max_by_key(|n| n.mem_bytes())?;
        if !node.try_claim() {
            return None;
        }
        debug!(index = %tree.name(), node = node.id(), "planned lru flush");
        Some(Task {
            kind: TaskKind::Lru,
            tree: Arc::clone(tree),
            node: Some(Arc::clone(node)),
        })
    }

    fn plan_compact(tree: &Arc<LsmTree>, nodes: &[Arc<Node>], zone: &ZoneConfig) -> Option<Task> {
        let mut candidates: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| {
                n.branch_count() >= zone.compact_watermark
                    || (n.branch_count() >= 2 && n.i0_dup_percent() >= zone.gc_watermark)
            })
            .collect();
        match zone.compact_mode {
            CompactMode::BranchCount => candidates.sort_by_key(|n| std::cmp::Reverse(n.branch_count())),
            CompactMode::Temperature => candidates.sort_by_key(|n| std::cmp::Reverse(n.temperature())),
        }
        let node = candidates.into_iter().find(|n| n.try_claim())?;
        let branch_ids = node.branches().iter().map(|b| b.id()).collect();
        debug!(index = %tree.name(), node = node.id(), "planned compaction");
        Some(Task {
            kind: TaskKind::Compact { branch_ids },
            tree: Arc::clone(tree),
            node: Some(Arc::clone(node)),
        })
    }

    /// Flush generations that have been sitting in memory too long.
    fn plan_age(tree: &Arc<LsmTree>, nodes: &[Arc<Node>], age_after: Duration) -> Option<Task> {
        let node = nodes
            .iter()
            .filter(|n| n.i0_bytes() > 0 && n.since_branch() >= age_after)
            .find(|n| n.try_claim())?;
        debug!(index = %tree.name(), node = node.id(), "planned age flush");
        Some(Task {
            kind: TaskKind::Age,
            tree: Arc::clone(tree),
            node: Some(Arc::clone(node)),
        })
    }
}
