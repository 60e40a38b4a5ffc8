//! Per-worker Sentry-side radix tree (spec.md [MODULE C2]).

use crate::core::{TreeCore, ROOT_ID};
use crate::error::TreeResult;
use nexuts_common::{RadixOp, WorkerId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Wraps [`TreeCore`] for one worker-adjacent Sentry process. A single
/// worker owns this tree in steady state, but `apply_op` still takes an
/// explicit `worker` id so the mutation algorithms can be shared verbatim
/// with [`crate::merge_tree::MergeTree`] (spec.md [MODULE C2] design note).
pub struct RadixTree {
    core: TreeCore,
    version_ctr: AtomicU64,
}

impl RadixTree {
    pub fn new() -> Self {
        Self {
            core: TreeCore::new(),
            version_ctr: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.version_ctr.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Applies one op under this worker's identity. Unknown paths or
    /// out-of-range offsets are returned as an error rather than panicking,
    /// so a batch driver can record a per-op failure and keep going
    /// (spec.md §4.1 "Failure modes").
    pub fn apply_op(&self, worker: &WorkerId, op: &RadixOp) -> TreeResult<()> {
        let version = self.next_version();
        match op {
            RadixOp::InsertNode {
                parent_path,
                prompt,
                prompt_value,
            } => {
                let start = self.core.locate(parent_path)?;
                self.core
                    .insert_at(start, prompt, prompt_value, worker, None, version)
            }
            RadixOp::DeleteNode {
                parent_path,
                split_length,
            } => self
                .core
                .delete_node_op(parent_path, *split_length, worker, None, version),
            RadixOp::SplitNode {
                parent_path,
                split_length,
            } => self.core.split_node_op(parent_path, *split_length, None, version),
        }
    }

    /// Convenience used by tests and by restart reseeding: insert starting
    /// at the root.
    pub fn insert(&self, key: &[nexuts_common::Token], value: &[nexuts_common::SlotId], worker: &WorkerId) -> TreeResult<()> {
        let version = self.next_version();
        self.core.insert_at(ROOT_ID, key, value, worker, None, version)
    }

    pub fn node_count(&self) -> usize {
        self.core.node_count()
    }

    pub fn core(&self) -> &TreeCore {
        &self.core
    }

    /// Discards this tree's contents and rebuilds it from a worker's
    /// `GET /v1/radixtree/full` tree blob (spec.md §4.6 "Restart").
    pub fn rebuild_from_dict(&self, root: &nexuts_common::dto::RadixTreeNodeDto) {
        self.core.rebuild_from_dict(root);
    }
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexuts_common::{SlotId, Token};

    fn toks(xs: &[u32]) -> Vec<Token> {
        xs.iter().map(|x| Token(*x)).collect()
    }

    fn slots(xs: &[i64]) -> Vec<SlotId> {
        xs.iter().map(|x| SlotId(*x)).collect()
    }

    #[test]
    fn insert_then_split_on_partial_match() {
        let tree = RadixTree::new();
        let w1 = WorkerId::from("w1");

        tree.insert(&toks(&[1, 2, 3, 4, 5]), &slots(&[10, 20, 30, 40, 50]), &w1)
            .unwrap();
        tree.insert(&toks(&[1, 2, 7]), &slots(&[10, 20, 70]), &w1)
            .unwrap();

        // root -> [1,2] -> { [3,4,5], [7] }
        assert_eq!(tree.node_count(), 4); // root + [1,2] + [3,4,5] + [7]

        let found = tree.core().search_instances_with_prefix(&toks(&[1, 2]));
        assert_eq!(found.len(), 1);
        assert!(found.contains(&w1));
    }

    #[test]
    fn insert_of_strict_prefix_records_payload_on_split_node() {
        let tree = RadixTree::new();
        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");

        tree.insert(&toks(&[1, 2, 3, 4, 5]), &slots(&[10, 20, 30, 40, 50]), &w1)
            .unwrap();
        // [1,2] is a strict prefix of the existing [1,2,3,4,5] edge: this
        // forces the same split as above, but the inserted key is fully
        // consumed by the split point instead of diverging past it.
        tree.insert(&toks(&[1, 2]), &slots(&[10, 20]), &w2).unwrap();

        let found = tree.core().search_instances_with_prefix(&toks(&[1, 2]));
        assert!(found.contains(&w1));
        assert!(found.contains(&w2), "payload for the prefix-only insert must land on the split node");
    }

    #[test]
    fn delete_on_nonexistent_path_is_not_found() {
        let tree = RadixTree::new();
        let w1 = WorkerId::from("w1");
        let err = tree
            .core()
            .delete_node_op(&toks(&[9, 9, 9]), 1, &w1, None, 1)
            .unwrap_err();
        assert!(matches!(err, crate::error::TreeError::NotFound(_)));
    }
}
