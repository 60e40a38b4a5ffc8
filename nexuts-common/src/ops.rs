//! The per-worker op stream (spec.md §3 "Per-worker op stream (C6)") shared by
//! the Sentry-side radix tree and the IC-side merge tree.

use crate::types::{SlotId, Token};
use serde::{Deserialize, Serialize};

/// One mutation on a radix tree, addressed by the token-prefix walk that
/// locates the target node (`parent_path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op_type", rename_all = "snake_case")]
pub enum RadixOp {
    InsertNode {
        parent_path: Vec<Token>,
        prompt: Vec<Token>,
        prompt_value: Vec<SlotId>,
    },
    DeleteNode {
        parent_path: Vec<Token>,
        split_length: usize,
    },
    SplitNode {
        parent_path: Vec<Token>,
        split_length: usize,
    },
}

impl RadixOp {
    pub fn kind(&self) -> &'static str {
        match self {
            RadixOp::InsertNode { .. } => "insert_node",
            RadixOp::DeleteNode { .. } => "delete_node",
            RadixOp::SplitNode { .. } => "split_node",
        }
    }
}

/// One op tagged with the worker whose cache produced it. A Sentry batches
/// ops from all the workers it watches into one `updates` list, so each
/// entry carries its own `instance_id` (mirrors
/// `original_source/Sentry/PushWithNexuts/push_to_nexuts.py`'s
/// `add_active_callback`, which stamps `instance_id` per buffered update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub instance_id: String,
    #[serde(flatten)]
    pub op: RadixOp,
}

/// A batch of ops from one Sentry, ordered by `sentry_ops_id` (spec.md §3
/// "Merge op stream (C3)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpBatch {
    pub sentry_id: String,
    pub sentry_ops_id: u64,
    pub timestamp: String,
    pub updates: Vec<PendingUpdate>,
}

/// Outcome of applying a single op within a batch; per spec.md §4.2 "a
/// per-op failure yields an error record and the remaining ops in the batch
/// still run".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub op_index: usize,
    pub ok: bool,
    pub error: Option<String>,
}

/// Aggregated report for one applied batch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchReport {
    pub results: Vec<OpResult>,
}

impl BatchReport {
    pub fn push_ok(&mut self, op_index: usize) {
        self.results.push(OpResult {
            op_index,
            ok: true,
            error: None,
        });
    }

    pub fn push_err(&mut self, op_index: usize, error: String) {
        self.results.push(OpResult {
            op_index,
            ok: false,
            error: Some(error),
        });
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }
}
