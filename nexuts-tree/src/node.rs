//! Versioned radix node (spec.md [MODULE C1]).
//!
//! Mirrors `original_source/Nexuts/Tree/tree.py`'s `TreeNode`: each node
//! carries a version counter and a lazily-materialized `old_info` side
//! record used by the copy-on-write snapshot protocol (spec.md §4.3).
//! Parent/children are stored as ids rather than pointers (spec.md §9
//! "Back-reference parent") and resolved through the tree's node table.

use nexuts_common::{SlotId, Token, WorkerId};
use std::collections::HashMap;

pub type NodeId = u64;

/// A deep copy of a node's fields as of some prior snapshot version.
#[derive(Debug, Clone)]
pub struct FrozenNode {
    pub version: u64,
    pub edge_key: Vec<Token>,
    pub value: HashMap<WorkerId, Vec<SlotId>>,
    pub children: Vec<(Token, NodeId)>,
    pub parent: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub edge_key: Vec<Token>,
    pub children: HashMap<Token, NodeId>,
    pub parent: Option<NodeId>,
    pub value: HashMap<WorkerId, Vec<SlotId>>,
    pub version: u64,
    pub old_info: Option<FrozenNode>,
}

impl Node {
    pub fn new_root(id: NodeId) -> Self {
        Self {
            id,
            edge_key: Vec::new(),
            children: HashMap::new(),
            parent: None,
            value: HashMap::new(),
            version: 0,
            old_info: None,
        }
    }

    pub fn new(id: NodeId, edge_key: Vec<Token>, parent: NodeId, version: u64) -> Self {
        Self {
            id,
            edge_key,
            children: HashMap::new(),
            parent: Some(parent),
            value: HashMap::new(),
            version,
            old_info: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_empty_leaf(&self) -> bool {
        self.value.is_empty() && self.children.is_empty()
    }

    /// Materializes `old_info` once per snapshot window, then bumps
    /// `version` to at least `new_version`. Must be called by every mutator
    /// before it changes `edge_key`/`value`/`children`/`parent` while a
    /// snapshot is active and this node hasn't been touched since
    /// `V_snap` (spec.md §4.3 step 3).
    pub fn cache_old_info(&mut self, v_snap: u64, new_version: u64) {
        if self.version <= v_snap && self.old_info.is_none() {
            self.old_info = Some(FrozenNode {
                version: v_snap,
                edge_key: self.edge_key.clone(),
                value: self.value.clone(),
                children: self.children.iter().map(|(t, id)| (*t, *id)).collect(),
                parent: self.parent,
            });
        }
        self.version = self.version.max(new_version);
    }

    /// Returns the state this node should contribute to a snapshot taken at
    /// `v_snap`: the frozen pre-mutation copy if one was captured for this
    /// exact version, otherwise the live state (valid only when the live
    /// version is still `<= v_snap`, i.e. nothing has mutated it yet).
    pub fn get_snap_state(&self, v_snap: u64) -> FrozenNode {
        if let Some(frozen) = &self.old_info {
            if frozen.version == v_snap {
                return frozen.clone();
            }
        }
        FrozenNode {
            version: self.version,
            edge_key: self.edge_key.clone(),
            value: self.value.clone(),
            children: self.children.iter().map(|(t, id)| (*t, *id)).collect(),
            parent: self.parent,
        }
    }

    pub fn clear_old_info(&mut self) {
        self.old_info = None;
    }
}

/// Returns the length of the common prefix of `a` and `b`.
pub fn match_length(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
