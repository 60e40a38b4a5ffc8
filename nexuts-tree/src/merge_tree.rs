//! Fleet-wide Merge Prefix Tree at the IC (spec.md [MODULE C3]).

use crate::core::TreeCore;
use crate::node::FrozenNode;
use dashmap::DashMap;
use nexuts_common::{BatchReport, OpBatch, WorkerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

struct FinishTracker {
    cursor: u64,
    completed: BTreeSet<u64>,
}

impl FinishTracker {
    fn new() -> Self {
        Self {
            cursor: 0,
            completed: BTreeSet::new(),
        }
    }

    /// Mirrors `original_source/Nexuts/Tree/tree.py`'s `on_task_finished`:
    /// records `version` as done, then advances `cursor` while the next
    /// contiguous version is present.
    fn on_task_finished(&mut self, version: u64) {
        self.completed.insert(version);
        loop {
            let next = self.cursor + 1;
            if self.completed.remove(&next) {
                self.cursor = next;
            } else {
                break;
            }
        }
    }
}

/// Heap entry ordered by `sentry_ops_id`, smallest first.
struct Ready(u64, OpBatch);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Ready {}
impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reverse so BinaryHeap (a max-heap) pops the smallest id first
        other.0.cmp(&self.0)
    }
}

struct SentrySequencer {
    next_expected: u64,
    pending_ids: HashSet<u64>,
    heap: BinaryHeap<Ready>,
}

impl SentrySequencer {
    fn new() -> Self {
        Self {
            next_expected: 1,
            pending_ids: HashSet::new(),
            heap: BinaryHeap::new(),
        }
    }
}

/// Adds fleet-wide bookkeeping on top of [`TreeCore`]: the global version
/// counter, the completion cursor, and per-sentry out-of-order buffering
/// (spec.md [MODULE C3]).
pub struct MergeTree {
    core: TreeCore,
    global_version: AtomicU64,
    finish: Mutex<FinishTracker>,
    sequencers: DashMap<String, Mutex<SentrySequencer>>,
    /// `Some(V_snap)` while a snapshot (spec.md §4.3) is in flight; mutators
    /// consult this to decide whether to materialize `old_info` before
    /// touching a node.
    snap_active: RwLock<Option<u64>>,
}

impl MergeTree {
    pub fn new() -> Self {
        Self {
            core: TreeCore::new(),
            global_version: AtomicU64::new(0),
            finish: Mutex::new(FinishTracker::new()),
            sequencers: DashMap::new(),
            snap_active: RwLock::new(None),
        }
    }

    /// Reconstructs a tree from a recovered on-disk snapshot (spec.md §4.3
    /// "Recovery"); `records` is `(id, edge_key, value, children_ids,
    /// version)` per record, exactly the on-disk shape. Used by
    /// `nexuts-wal::SnapshotManager::recover`.
    pub fn rebuild_from_snapshot(
        &self,
        records: Vec<(
            crate::node::NodeId,
            Vec<nexuts_common::Token>,
            std::collections::HashMap<WorkerId, Vec<nexuts_common::SlotId>>,
            Vec<crate::node::NodeId>,
            u64,
        )>,
        global_version: u64,
    ) {
        self.core.rebuild_from_snapshot(records);
        self.global_version.store(global_version, Ordering::SeqCst);
        self.finish.lock().cursor = global_version;
    }

    /// Applies a single already-ordered op during WAL replay, bypassing the
    /// per-sentry sequencer (replay order is the durable log's order) and
    /// without going through the WAL again.
    pub fn apply_replayed(&self, worker: &WorkerId, op: &nexuts_common::RadixOp, version: u64) {
        let _ = self.apply_one(worker, op, version);
        self.global_version.fetch_max(version, Ordering::SeqCst);
        self.finish.lock().on_task_finished(version);
    }

    /// Step 1 of spec.md §4.3: freezes `V_snap = global_version` and
    /// `F_snap = finished_version` under the snapshot flag, returning both.
    pub fn begin_snapshot(&self) -> (u64, u64) {
        let mut guard = self.snap_active.write();
        let v_snap = self.global_version();
        let f_snap = self.finished_version();
        *guard = Some(v_snap);
        (v_snap, f_snap)
    }

    pub fn snap_version(&self) -> Option<u64> {
        *self.snap_active.read()
    }

    /// Step 5 tail of spec.md §4.3: clears every node's `old_info` and the
    /// snapshot flag once the snapshot file and WAL commit are durable.
    pub fn end_snapshot(&self) {
        self.core.clear_all_old_info();
        *self.snap_active.write() = None;
    }

    pub fn bfs_snapshot(&self, v_snap: u64) -> Vec<(crate::node::NodeId, FrozenNode)> {
        self.core.bfs_snapshot(v_snap)
    }

    pub fn core(&self) -> &TreeCore {
        &self.core
    }

    pub fn global_version(&self) -> u64 {
        self.global_version.load(Ordering::SeqCst)
    }

    pub fn finished_version(&self) -> u64 {
        self.finish.lock().cursor
    }

    fn next_global_version(&self) -> u64 {
        self.global_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Accepts a batch arriving for `sentry_id`, buffering it if it is
    /// ahead of the next expected `sentry_ops_id`, and returns every batch
    /// (including `batch` itself) that is now ready to apply, in order.
    /// Duplicate `sentry_ops_id` values are silently dropped (spec.md §4.2
    /// "idempotent replay").
    pub fn accept_batch(&self, batch: OpBatch) -> Vec<OpBatch> {
        let entry = self
            .sequencers
            .entry(batch.sentry_id.clone())
            .or_insert_with(|| Mutex::new(SentrySequencer::new()));
        let mut seq = entry.lock();

        let id = batch.sentry_ops_id;
        if id < seq.next_expected || seq.pending_ids.contains(&id) {
            return Vec::new();
        }
        seq.pending_ids.insert(id);
        seq.heap.push(Ready(id, batch));

        let mut ready = Vec::new();
        while let Some(top) = seq.heap.peek() {
            if top.0 == seq.next_expected {
                let Ready(id, b) = seq.heap.pop().unwrap();
                seq.pending_ids.remove(&id);
                seq.next_expected += 1;
                ready.push(b);
            } else {
                break;
            }
        }
        ready
    }

    /// Applies every op in `batch` in list order, assigning a distinct
    /// `global_version` to each (spec.md §4.2 "Write path and WAL"). The
    /// caller is responsible for durably persisting each op to the WAL
    /// before relying on the result (this method only mutates the
    /// in-memory tree and reports per-op outcomes).
    pub fn apply_batch(&self, batch: &OpBatch) -> (Vec<u64>, BatchReport) {
        let mut report = BatchReport::default();
        let mut versions = Vec::with_capacity(batch.updates.len());

        for (idx, update) in batch.updates.iter().enumerate() {
            let version = self.next_global_version();
            versions.push(version);
            let worker = WorkerId::from(update.instance_id.clone());
            let result = self.apply_one(&worker, &update.op, version);
            match result {
                Ok(()) => report.push_ok(idx),
                Err(e) => report.push_err(idx, e.to_string()),
            }
            self.finish.lock().on_task_finished(version);
        }
        (versions, report)
    }

    fn apply_one(
        &self,
        worker: &WorkerId,
        op: &nexuts_common::RadixOp,
        version: u64,
    ) -> crate::error::TreeResult<()> {
        use nexuts_common::RadixOp::*;
        let snap = self.snap_version();
        match op {
            InsertNode {
                parent_path,
                prompt,
                prompt_value,
            } => {
                let start = self.core.locate(parent_path)?;
                self.core
                    .insert_at(start, prompt, prompt_value, worker, snap, version)
            }
            DeleteNode {
                parent_path,
                split_length,
            } => self
                .core
                .delete_node_op(parent_path, *split_length, worker, snap, version),
            SplitNode {
                parent_path,
                split_length,
            } => self.core.split_node_op(parent_path, *split_length, snap, version),
        }
    }

    pub fn search_instances_with_prefix(&self, key: &[nexuts_common::Token]) -> HashSet<WorkerId> {
        self.core.search_instances_with_prefix(key)
    }

    pub fn evict_by_worker(&self, worker: &WorkerId) {
        self.core.evict_by_worker(worker);
    }
}

impl Default for MergeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexuts_common::{PendingUpdate, RadixOp, Token};

    fn batch(sentry_ops_id: u64, instance_id: &str) -> OpBatch {
        OpBatch {
            sentry_id: "s1".into(),
            sentry_ops_id,
            timestamp: "t".into(),
            updates: vec![PendingUpdate {
                instance_id: instance_id.into(),
                op: RadixOp::InsertNode {
                    parent_path: vec![],
                    prompt: vec![Token(sentry_ops_id as u32)],
                    prompt_value: vec![nexuts_common::SlotId(1)],
                },
            }],
        }
    }

    #[test]
    fn out_of_order_batches_are_buffered_until_released_in_order() {
        let tree = MergeTree::new();

        let ready = tree.accept_batch(batch(2, "w1"));
        assert!(ready.is_empty());

        let ready = tree.accept_batch(batch(1, "w1"));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].sentry_ops_id, 1);
        assert_eq!(ready[1].sentry_ops_id, 2);

        // duplicate is ignored
        let ready = tree.accept_batch(batch(1, "w1"));
        assert!(ready.is_empty());
    }

    #[test]
    fn empty_prefix_returns_all_workers() {
        let tree = MergeTree::new();
        let w1 = WorkerId::from("w1");
        tree.core()
            .insert_at(
                crate::core::ROOT_ID,
                &[Token(1), Token(2)],
                &[nexuts_common::SlotId(1), nexuts_common::SlotId(2)],
                &w1,
                None,
                1,
            )
            .unwrap();
        let found = tree.search_instances_with_prefix(&[]);
        assert!(found.contains(&w1));
    }
}
