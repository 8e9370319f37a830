//! Pull-model background scheduler.
//!
//! Workers call `next_task` in a loop; the scheduler plans at most one
//! task per call by walking the registered trees in order, consulting
//! the planner with the current quota percentile, per-tree running
//! counters, and whichever periodic triggers have come due. An idle
//! worker parks on a condvar with a short timeout, so a burst of writes
//! never waits longer than `idle_park` for its flush.
//!
//! Checkpoint and age triggers stay raised until a planning pass over
//! every tree produces nothing, which drains all dirty nodes across
//! several tasks instead of flushing just one per interval. The gc
//! trigger enqueues one sweep per registered tree.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::quota::Quota;
use crate::tree::compact;
use crate::tree::planner::PlanContext;
use crate::tree::{LsmTree, Planner, Task, TaskKind};
use crate::tx::TxManager;

#[derive(Default)]
struct Running {
    branches: usize,
    compacts: usize,
}

struct State {
    trees: Vec<Arc<LsmTree>>,
    /// Condemned trees awaiting purge, already detached from `trees`.
    drops: Vec<Arc<LsmTree>>,
    /// Trees owed a garbage sweep from the last gc tick.
    pending_gc: Vec<Arc<LsmTree>>,
    running: HashMap<String, Running>,
    last_checkpoint: Instant,
    last_gc: Instant,
    last_age: Instant,
    /// Raised on the interval, lowered once a pass plans nothing.
    checkpoint: bool,
    age: bool,
    shutdown: bool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    quota: Arc<Quota>,
    state: Mutex<State>,
    wake: Condvar,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, quota: Arc<Quota>) -> Self {
        let now = Instant::now();
        Self {
            config,
            quota,
            state: Mutex::new(State {
                trees: Vec::new(),
                drops: Vec::new(),
                pending_gc: Vec::new(),
                running: HashMap::new(),
                last_checkpoint: now,
                last_gc: now,
                last_age: now,
                checkpoint: false,
                age: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn register(&self, tree: Arc<LsmTree>) {
        self.state.lock().unwrap().trees.push(tree);
        self.wake.notify_all();
    }

    /// Detach a tree and queue its purge. Drops outrank everything else.
    pub fn queue_drop(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.trees.iter().position(|t| t.name() == name) {
            let tree = state.trees.remove(pos);
            state.pending_gc.retain(|t| t.name() != name);
            state.drops.push(tree);
        }
        drop(state);
        self.wake.notify_all();
    }

    /// Nudge parked workers; called after commits so flush-worthy data
    /// is noticed before the next poll.
    pub fn kick(&self) {
        self.wake.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.wake.notify_all();
    }

    /// Block until a task is available or shutdown. Pending drops are
    /// still served after shutdown so close can finish them.
    pub fn next_task(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(tree) = state.drops.pop() {
                return Some(Task {
                    kind: TaskKind::Drop,
                    tree,
                    node: None,
                });
            }
            if state.shutdown {
                return None;
            }
            if let Some(task) = self.plan(&mut state) {
                return Some(task);
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, self.config.idle_park)
                .unwrap();
            state = guard;
        }
    }

    fn plan(&self, state: &mut State) -> Option<Task> {
        let now = Instant::now();
        if now.duration_since(state.last_checkpoint) >= self.config.checkpoint_interval {
            state.checkpoint = true;
            state.last_checkpoint = now;
        }
        if now.duration_since(state.last_age) >= self.config.age_interval {
            state.age = true;
            state.last_age = now;
        }
        if now.duration_since(state.last_gc) >= self.config.gc_interval {
            state.pending_gc = state.trees.clone();
            state.last_gc = now;
        }

        let quota_percent = self.quota.percent_used();
        for tree in &state.trees {
            let running = state.running.get(tree.name());
            let ctx = PlanContext {
                quota_percent,
                checkpoint: state.checkpoint,
                age: state.age,
                gc: false,
                age_after: self.config.age_interval,
                running_branches: running.map_or(0, |r| r.branches),
                running_compacts: running.map_or(0, |r| r.compacts),
            };
            if let Some(task) = Planner::plan(tree, &ctx) {
                let running = state.running.entry(tree.name().to_string()).or_default();
                if task.is_flush() {
                    running.branches += 1;
                } else if matches!(task.kind, TaskKind::Compact { .. }) {
                    running.compacts += 1;
                }
                debug!(index = %tree.name(), kind = ?task.kind, "dispatching task");
                return Some(task);
            }
        }
        // Nothing left to flush anywhere; lower the drain flags.
        state.checkpoint = false;
        state.age = false;

        if let Some(tree) = state.pending_gc.pop() {
            return Some(Task {
                kind: TaskKind::Gc,
                tree,
                node: None,
            });
        }
        None
    }

    /// Release the task's claim and counters. Must be called exactly
    /// once per task handed out, success or failure.
    pub fn complete(&self, task: &Task) {
        if let Some(node) = &task.node {
            node.release_claim();
        }
        {
            let mut state = self.state.lock().unwrap();
            let running = state
                .running
                .entry(task.tree.name().to_string())
                .or_default();
            if task.is_flush() {
                running.branches = running.branches.saturating_sub(1);
            } else if matches!(task.kind, TaskKind::Compact { .. }) {
                running.compacts = running.compacts.saturating_sub(1);
            }
        }
        self.wake.notify_all();
    }
}

/// Background worker threads driving the scheduler until shutdown.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        scheduler: Arc<Scheduler>,
        tx_manager: Arc<TxManager>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let scheduler = Arc::clone(&scheduler);
            let tx_manager = Arc::clone(&tx_manager);
            let handle = std::thread::Builder::new()
                .name(format!("vinyl-worker-{}", i))
                .spawn(move || worker_loop(scheduler, tx_manager))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(scheduler: Arc<Scheduler>, tx_manager: Arc<TxManager>) {
    while let Some(task) = scheduler.next_task() {
        if matches!(task.kind, TaskKind::Gc) {
            // Conflict slots age out on the same cadence as file gc.
            tx_manager.gc();
        }
        let snapshots = tx_manager.live_snapshots();
        if let Err(e) = compact::execute(&task, &snapshots) {
            error!(index = %task.tree.name(), error = %e, "background task failed");
        }
        scheduler.complete(&task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, ZoneConfig};
    use crate::document::{Document, Scheme, Sequence};
    use crate::vfs::{MemFs, Vfs};
    use std::path::Path;
    use std::time::Duration;

    fn quota() -> Arc<Quota> {
        Arc::new(Quota::new(64 * 1024 * 1024))
    }

    fn scheduler(config: SchedulerConfig, quota: &Arc<Quota>) -> Scheduler {
        Scheduler::new(config, Arc::clone(quota))
    }

    fn tree(config: IndexConfig, quota: &Arc<Quota>) -> Arc<LsmTree> {
        let vfs: Arc<dyn Vfs> = Arc::new(MemFs::new());
        LsmTree::create(
            vfs,
            Path::new("/db"),
            config,
            Scheme::replacing(),
            Arc::new(Sequence::new()),
            Arc::clone(quota),
        )
        .expect("Tree creation failed")
    }

    fn eager_zones() -> Vec<ZoneConfig> {
        let mut zones = ZoneConfig::default_zones();
        zones[0].branch_watermark = 1024;
        zones
    }

    fn fill(tree: &Arc<LsmTree>, bytes: usize) {
        let mut written = 0;
        let mut lsn = 0;
        while written < bytes {
            lsn += 1;
            let doc = Document::new(format!("key-{:06}", lsn).into_bytes(), vec![0u8; 256], lsn, 0);
            written += doc.size();
            tree.set(doc).unwrap();
        }
    }

    #[test]
    fn test_shutdown_unblocks_workers() {
        let quota = quota();
        let sched = scheduler(SchedulerConfig::default(), &quota);
        sched.shutdown();
        assert!(sched.next_task().is_none());
    }

    #[test]
    fn test_dirty_tree_yields_flush_task() {
        let quota = quota();
        let sched = scheduler(SchedulerConfig::default(), &quota);
        let tree = tree(IndexConfig::new("t").zones(eager_zones()), &quota);
        fill(&tree, 8 * 1024);
        sched.register(tree);

        let task = sched.next_task().expect("Flush expected");
        assert_eq!(task.kind, TaskKind::Branch);
        sched.complete(&task);
    }

    #[test]
    fn test_counters_gate_concurrency() {
        let quota = quota();
        let sched = scheduler(SchedulerConfig::default(), &quota);
        // branch_limit 1 in the default relaxed zone.
        let tree = tree(IndexConfig::new("t").zones(eager_zones()), &quota);
        fill(&tree, 8 * 1024);
        sched.register(Arc::clone(&tree));

        let first = sched.next_task().expect("First flush");
        {
            // A second poll must not hand out a concurrent flush.
            let mut state = sched.state.lock().unwrap();
            assert!(sched.plan(&mut state).is_none());
        }
        sched.complete(&first);
    }

    #[test]
    fn test_drop_outranks_everything() {
        let quota = quota();
        let sched = scheduler(SchedulerConfig::default(), &quota);
        let dirty = tree(IndexConfig::new("busy").zones(eager_zones()), &quota);
        fill(&dirty, 8 * 1024);
        sched.register(dirty);
        let doomed = tree(IndexConfig::new("doomed"), &quota);
        sched.register(doomed);

        sched.queue_drop("doomed");
        let task = sched.next_task().expect("Task expected");
        assert_eq!(task.kind, TaskKind::Drop);
        assert_eq!(task.tree.name(), "doomed");
    }

    #[test]
    fn test_drop_served_after_shutdown() {
        let quota = quota();
        let sched = scheduler(SchedulerConfig::default(), &quota);
        sched.register(tree(IndexConfig::new("doomed"), &quota));
        sched.queue_drop("doomed");
        sched.shutdown();

        assert!(matches!(
            sched.next_task().map(|t| t.kind),
            Some(TaskKind::Drop)
        ));
        assert!(sched.next_task().is_none());
    }

    #[test]
    fn test_gc_tick_sweeps_every_tree() {
        let quota = quota();
        let config = SchedulerConfig::default().gc_interval(Duration::ZERO);
        let sched = scheduler(config, &quota);
        sched.register(tree(IndexConfig::new("a"), &quota));
        sched.register(tree(IndexConfig::new("b"), &quota));

        let mut swept = Vec::new();
        for _ in 0..2 {
            let task = sched.next_task().expect("Gc expected");
            assert_eq!(task.kind, TaskKind::Gc);
            swept.push(task.tree.name().to_string());
            sched.complete(&task);
        }
        swept.sort();
        assert_eq!(swept, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_checkpoint_drains_all_dirty_trees() {
        let quota = quota();
        let config = SchedulerConfig::default().checkpoint_interval(Duration::ZERO);
        let sched = scheduler(config, &quota);
        for name in ["a", "b"] {
            let tree = tree(IndexConfig::new(name), &quota);
            fill(&tree, 4 * 1024);
            sched.register(tree);
        }

        let mut flushed = Vec::new();
        for _ in 0..2 {
            let task = sched.next_task().expect("Checkpoint flush expected");
            assert_eq!(task.kind, TaskKind::Checkpoint);
            flushed.push(task.tree.name().to_string());
            compact::execute(&task, &[]).expect("Flush failed");
            sched.complete(&task);
        }
        flushed.sort();
        assert_eq!(flushed, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_worker_pool_runs_and_joins() {
        let quota = quota();
        let config = SchedulerConfig::default()
            .checkpoint_interval(Duration::from_millis(1))
            .idle_park(Duration::from_millis(1));
        let sched = Arc::new(scheduler(config, &quota));
        let tree = tree(IndexConfig::new("t"), &quota);
        fill(&tree, 4 * 1024);
        sched.register(Arc::clone(&tree));

        let mgr = Arc::new(TxManager::new(Arc::new(Sequence::new())));
        let pool = WorkerPool::spawn(2, Arc::clone(&sched), mgr).expect("Spawn failed");
        let deadline = Instant::now() + Duration::from_secs(5);
        while tree.node_for(b"").branch_count() == 0 {
            assert!(Instant::now() < deadline, "Checkpoint flush never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.shutdown();
        pool.join();
        assert_eq!(tree.mem_bytes(), 0);
    }
}
