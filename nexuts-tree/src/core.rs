//! Mutation core shared by the Sentry-side [`crate::sentry_tree::RadixTree`]
//! and the IC-side [`crate::merge_tree::MergeTree`] (spec.md [MODULE C2]/
//! [MODULE C3] share one algorithm set).
//!
//! Node-level locking follows spec.md §5: a walk acquires `parent.lock`
//! then `child.lock`, releases the parent lock before descending further,
//! and never takes a tree-wide lock on the mutation path.

use crate::error::{TreeError, TreeResult};
use crate::node::{match_length, FrozenNode, Node, NodeId};
use dashmap::DashMap;
use nexuts_common::dto::RadixTreeNodeDto;
use nexuts_common::{SlotId, Token, WorkerId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const ROOT_ID: NodeId = 0;

type NodeRef = Arc<RwLock<Node>>;

/// Shared node table plus the structural mutation algorithms. Holds no
/// notion of `global_version`/per-sentry ordering; those live one layer up
/// in [`crate::merge_tree::MergeTree`].
pub struct TreeCore {
    pub nodes: DashMap<NodeId, NodeRef>,
    next_id: AtomicU64,
}

impl TreeCore {
    pub fn new() -> Self {
        let nodes = DashMap::new();
        nodes.insert(ROOT_ID, Arc::new(RwLock::new(Node::new_root(ROOT_ID))));
        Self {
            nodes,
            next_id: AtomicU64::new(ROOT_ID + 1),
        }
    }

    pub fn alloc_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Used by recovery to keep the id counter ahead of every restored id.
    pub fn bump_id_counter(&self, at_least: NodeId) {
        self.next_id.fetch_max(at_least + 1, Ordering::Relaxed);
    }

    pub fn get(&self, id: NodeId) -> TreeResult<NodeRef> {
        self.nodes
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TreeError::Internal(format!("missing node id {id}")))
    }

    fn cache_or_bump(node: &mut Node, snap: Option<u64>, version: u64) {
        match snap {
            Some(v_snap) => node.cache_old_info(v_snap, version),
            None => node.version = node.version.max(version),
        }
    }

    /// Walks `path` from the root, consuming full edges one at a time, and
    /// returns the node id exactly at the end of `path`. Used by
    /// `insert_node`'s `parent_path` (spec.md §3 "parent_path locates an
    /// existing node").
    pub fn locate(&self, path: &[Token]) -> TreeResult<NodeId> {
        let mut current = ROOT_ID;
        let mut remaining = path;
        while !remaining.is_empty() {
            let current_arc = self.get(current)?;
            let first = remaining[0];
            let child_id = {
                let guard = current_arc.read();
                guard.children.get(&first).copied()
            }
            .ok_or_else(|| TreeError::NotFound(format!("no child for token {first}")))?;
            let child_arc = self.get(child_id)?;
            let edge_len = { child_arc.read().edge_key.len() };
            if remaining.len() < edge_len {
                return Err(TreeError::NotFound(
                    "path does not land on a node boundary".into(),
                ));
            }
            let matches = {
                let guard = child_arc.read();
                remaining[..edge_len] == guard.edge_key[..]
            };
            if !matches {
                return Err(TreeError::NotFound("edge mismatch".into()));
            }
            remaining = &remaining[edge_len..];
            current = child_id;
        }
        Ok(current)
    }

    /// Inserts `key`/`value` for `worker`, starting the walk at `start`.
    /// Implements spec.md §4.1 "Insert".
    pub fn insert_at(
        &self,
        start: NodeId,
        key: &[Token],
        value: &[SlotId],
        worker: &WorkerId,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<()> {
        if key.len() != value.len() {
            return Err(TreeError::Validation(
                "key and value length mismatch".into(),
            ));
        }
        if key.is_empty() {
            return Ok(());
        }

        let mut current_id = start;
        let mut remaining_key = key;
        let mut remaining_val = value;

        loop {
            if remaining_key.is_empty() {
                return Ok(());
            }
            let current_arc = self.get(current_id)?;
            let first = remaining_key[0];
            let child_id = {
                let guard = current_arc.read();
                guard.children.get(&first).copied()
            };

            match child_id {
                None => {
                    let new_id = self.alloc_id();
                    {
                        let mut current = current_arc.write();
                        Self::cache_or_bump(&mut current, snap, version);
                        current.children.insert(first, new_id);
                    }
                    let mut new_node = Node::new(new_id, remaining_key.to_vec(), current_id, version);
                    new_node.value.insert(worker.clone(), remaining_val.to_vec());
                    self.nodes.insert(new_id, Arc::new(RwLock::new(new_node)));
                    return Ok(());
                }
                Some(child_id) => {
                    let child_arc = self.get(child_id)?;
                    let edge_len = { child_arc.read().edge_key.len() };
                    let length = {
                        let guard = child_arc.read();
                        match_length(remaining_key, &guard.edge_key)
                    };

                    if length < edge_len {
                        let new_interior = self.split_child(
                            current_id,
                            &current_arc,
                            child_id,
                            &child_arc,
                            length,
                            snap,
                            version,
                        )?;
                        if length == remaining_key.len() {
                            // The inserted key ends exactly at the split point: it
                            // doesn't diverge into a new sibling edge, so record its
                            // payload directly on the new interior node.
                            let interior_arc = self.get(new_interior)?;
                            interior_arc.write().value.insert(worker.clone(), remaining_val[..length].to_vec());
                        }
                        remaining_key = &remaining_key[length..];
                        remaining_val = &remaining_val[length..];
                        current_id = new_interior;
                    } else {
                        {
                            let mut child = child_arc.write();
                            Self::cache_or_bump(&mut child, snap, version);
                            child.value.insert(worker.clone(), remaining_val[..length].to_vec());
                        }
                        remaining_key = &remaining_key[length..];
                        remaining_val = &remaining_val[length..];
                        current_id = child_id;
                    }
                }
            }
        }
    }

    /// Structural split of `child_id` (child of `parent_id`) at `length`
    /// tokens into its edge. Returns the new interior node's id. Shared by
    /// insert's implicit split and the explicit `split_node` op (spec.md
    /// §4.1 "Split-only").
    #[allow(clippy::too_many_arguments)]
    fn split_child(
        &self,
        parent_id: NodeId,
        parent_arc: &NodeRef,
        child_id: NodeId,
        child_arc: &NodeRef,
        length: usize,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<NodeId> {
        let new_id = self.alloc_id();
        let first_tok;
        let new_first_tok;
        {
            let mut child = child_arc.write();
            if length == 0 || length >= child.edge_key.len() {
                return Err(TreeError::Validation("split offset out of range".into()));
            }
            Self::cache_or_bump(&mut child, snap, version);

            first_tok = child.edge_key[0];
            let new_edge = child.edge_key[..length].to_vec();
            let old_suffix = child.edge_key[length..].to_vec();

            let mut new_value = std::collections::HashMap::new();
            let mut child_value = std::collections::HashMap::new();
            for (w, slots) in child.value.iter() {
                new_value.insert(w.clone(), slots[..length].to_vec());
                child_value.insert(w.clone(), slots[length..].to_vec());
            }

            child.edge_key = old_suffix;
            child.value = child_value;
            child.parent = Some(new_id);
            new_first_tok = child.edge_key[0];

            let mut new_node = Node::new(new_id, new_edge, parent_id, version);
            new_node.value = new_value;
            new_node.children.insert(new_first_tok, child_id);
            self.nodes.insert(new_id, Arc::new(RwLock::new(new_node)));
        }
        {
            let mut parent = parent_arc.write();
            Self::cache_or_bump(&mut parent, snap, version);
            parent.children.insert(first_tok, new_id);
        }
        Ok(new_id)
    }

    /// Explicit `split_node(path, L)` (spec.md §4.1). `path` locates the
    /// existing node exactly (unlike `delete_node`, whose `path` may stop
    /// mid-edge).
    pub fn split_node_op(
        &self,
        path: &[Token],
        length: usize,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<()> {
        let node_id = self.locate(path)?;
        let node_arc = self.get(node_id)?;
        let parent_id = { node_arc.read().parent }
            .ok_or_else(|| TreeError::Validation("cannot split the root".into()))?;
        let edge_len = { node_arc.read().edge_key.len() };
        if length >= edge_len {
            // no-op per spec.md §8 boundary behavior
            return Ok(());
        }
        let parent_arc = self.get(parent_id)?;
        self.split_child(parent_id, &parent_arc, node_id, &node_arc, length, snap, version)?;
        Ok(())
    }

    /// `delete_node(path, split_length)` (spec.md §4.1 "Delete"). Walks
    /// `path` consuming edges until `split_length` tokens have been
    /// consumed, which may land mid-edge.
    pub fn delete_node_op(
        &self,
        path: &[Token],
        split_length: usize,
        worker: &WorkerId,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<()> {
        let mut current_id = ROOT_ID;
        let mut remaining = path;
        let mut consumed = 0usize;

        loop {
            if remaining.is_empty() {
                return Err(TreeError::NotFound("path exhausted before split_length".into()));
            }
            let current_arc = self.get(current_id)?;
            let first = remaining[0];
            let child_id = {
                let guard = current_arc.read();
                guard.children.get(&first).copied()
            }
            .ok_or_else(|| TreeError::NotFound(format!("no child for token {first}")))?;
            let child_arc = self.get(child_id)?;

            let (edge_len, has_worker) = {
                let guard = child_arc.read();
                (guard.edge_key.len(), guard.value.contains_key(worker))
            };
            if !has_worker {
                return Err(TreeError::NotFound(format!(
                    "worker {worker} has no payload on this path"
                )));
            }

            let match_len = {
                let guard = child_arc.read();
                match_length(remaining, &guard.edge_key)
            };
            if match_len == 0 {
                return Err(TreeError::NotFound("edge mismatch".into()));
            }

            let new_consumed = consumed + match_len;
            if new_consumed < split_length && match_len == edge_len {
                remaining = &remaining[match_len..];
                consumed = new_consumed;
                current_id = child_id;
                continue;
            }

            let index = split_length
                .checked_sub(consumed)
                .filter(|i| *i <= edge_len)
                .ok_or_else(|| TreeError::Validation("split_length out of range".into()))?;

            let single_worker = { child_arc.read().value.len() == 1 };

            if single_worker {
                if index == 0 {
                    self.detach_subtree(current_id, first, snap, version)?;
                } else {
                    self.truncate_node(child_id, index, worker, snap, version)?;
                }
            } else if index == 0 {
                {
                    let mut child = child_arc.write();
                    Self::cache_or_bump(&mut child, snap, version);
                    child.value.remove(worker);
                }
                self.maybe_prune(child_id)?;
            } else if index == edge_len {
                {
                    let mut child = child_arc.write();
                    Self::cache_or_bump(&mut child, snap, version);
                    child.value.remove(worker);
                }
                self.maybe_prune(child_id)?;
            } else {
                let new_interior =
                    self.split_child(current_id, &current_arc, child_id, &child_arc, index, snap, version)?;
                {
                    let mut child = child_arc.write();
                    child.value.remove(worker);
                }
                self.maybe_prune(child_id)?;
                let _ = new_interior;
            }
            return Ok(());
        }
    }

    /// Removes `child_tok`'s subtree entirely from `parent_id`'s children.
    fn detach_subtree(
        &self,
        parent_id: NodeId,
        child_tok: Token,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<()> {
        let parent_arc = self.get(parent_id)?;
        let removed = {
            let mut parent = parent_arc.write();
            Self::cache_or_bump(&mut parent, snap, version);
            parent.children.remove(&child_tok)
        };
        if let Some(child_id) = removed {
            self.drop_subtree(child_id);
        }
        self.maybe_prune(parent_id)
    }

    fn drop_subtree(&self, node_id: NodeId) {
        let children: Vec<NodeId> = {
            match self.nodes.get(&node_id) {
                Some(n) => n.read().children.values().copied().collect(),
                None => return,
            }
        };
        for c in children {
            self.drop_subtree(c);
        }
        self.nodes.remove(&node_id);
    }

    /// Truncates `node_id`'s edge/payload to `index` tokens and drops every
    /// descendant (the departing worker owned the whole subtree).
    fn truncate_node(
        &self,
        node_id: NodeId,
        index: usize,
        worker: &WorkerId,
        snap: Option<u64>,
        version: u64,
    ) -> TreeResult<()> {
        let node_arc = self.get(node_id)?;
        let children: Vec<NodeId> = {
            let mut node = node_arc.write();
            Self::cache_or_bump(&mut node, snap, version);
            node.edge_key.truncate(index);
            if let Some(slots) = node.value.get_mut(worker) {
                slots.truncate(index);
            }
            node.children.drain().map(|(_, id)| id).collect()
        };
        for c in children {
            self.drop_subtree(c);
        }
        Ok(())
    }

    /// If `node_id` has become payload-empty and childless, unlink it from
    /// its parent and repeat upward (spec.md §3 "Lifecycles").
    fn maybe_prune(&self, node_id: NodeId) -> TreeResult<()> {
        let mut current = node_id;
        loop {
            if current == ROOT_ID {
                return Ok(());
            }
            let node_arc = self.get(current)?;
            let (empty, parent, first_tok) = {
                let guard = node_arc.read();
                (
                    guard.is_empty_leaf(),
                    guard.parent,
                    guard.edge_key.first().copied(),
                )
            };
            if !empty {
                return Ok(());
            }
            let (parent_id, tok) = match (parent, first_tok) {
                (Some(p), Some(t)) => (p, t),
                _ => return Ok(()),
            };
            let parent_arc = self.get(parent_id)?;
            {
                let mut parent = parent_arc.write();
                parent.children.remove(&tok);
            }
            self.nodes.remove(&current);
            current = parent_id;
        }
    }

    /// `search_instances_with_prefix` (spec.md §4.2): returns every worker
    /// id present at or below the deepest node reached by the longest
    /// prefix of `key` matched from root. Empty `key` returns every worker
    /// anywhere in the tree.
    pub fn search_instances_with_prefix(&self, key: &[Token]) -> std::collections::HashSet<WorkerId> {
        if key.is_empty() {
            return self.all_workers();
        }
        let mut current_id = ROOT_ID;
        let mut remaining = key;
        loop {
            if remaining.is_empty() {
                break;
            }
            let current_arc = match self.get(current_id) {
                Ok(n) => n,
                Err(_) => break,
            };
            let first = remaining[0];
            let child_id = {
                let guard = current_arc.read();
                guard.children.get(&first).copied()
            };
            let child_id = match child_id {
                Some(c) => c,
                None => break,
            };
            let child_arc = match self.get(child_id) {
                Ok(n) => n,
                Err(_) => break,
            };
            let length = {
                let guard = child_arc.read();
                match_length(remaining, &guard.edge_key)
            };
            let edge_len = { child_arc.read().edge_key.len() };
            current_id = child_id;
            if length < edge_len {
                break;
            }
            remaining = &remaining[length..];
        }
        self.workers_at_or_below(current_id)
    }

    fn workers_at_or_below(&self, node_id: NodeId) -> std::collections::HashSet<WorkerId> {
        let mut out = std::collections::HashSet::new();
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            if let Ok(node_arc) = self.get(id) {
                let guard = node_arc.read();
                out.extend(guard.value.keys().cloned());
                stack.extend(guard.children.values().copied());
            }
        }
        out
    }

    fn all_workers(&self) -> std::collections::HashSet<WorkerId> {
        self.workers_at_or_below(ROOT_ID)
    }

    /// `evict_by_worker` (spec.md §4.2): removes `worker` from every node's
    /// `value`; subtrees left payload-empty and childless are unlinked.
    pub fn evict_by_worker(&self, worker: &WorkerId) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        let mut touched = Vec::new();
        for id in ids {
            if let Ok(node_arc) = self.get(id) {
                let had = {
                    let mut node = node_arc.write();
                    node.value.remove(worker).is_some()
                };
                if had {
                    touched.push(id);
                }
            }
        }
        for id in touched {
            let _ = self.maybe_prune(id);
        }
    }

    /// BFS snapshot walk: emits, for every reachable node, the state it
    /// should contribute at `v_snap` (spec.md §4.3 step 4).
    pub fn bfs_snapshot(&self, v_snap: u64) -> Vec<(NodeId, FrozenNode)> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(ROOT_ID);
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let node_arc = match self.get(id) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let frozen = {
                let guard = node_arc.read();
                guard.get_snap_state(v_snap)
            };
            for (_, child_id) in &frozen.children {
                queue.push_back(*child_id);
            }
            out.push((id, frozen));
        }
        out
    }

    /// Clears `old_info` on every node; called once a snapshot commits.
    pub fn clear_all_old_info(&self) {
        for entry in self.nodes.iter() {
            entry.value().write().clear_old_info();
        }
    }

    /// Rebuilds the node table from a BFS-ordered snapshot record list
    /// (spec.md §4.3 "Recovery"). Children are relinked using each
    /// record's `children` id list.
    pub fn rebuild_from_records(&self, records: Vec<(NodeId, FrozenNode)>) {
        self.nodes.clear();
        let mut max_id = ROOT_ID;
        for (id, frozen) in &records {
            max_id = max_id.max(*id);
            let mut node = Node {
                id: *id,
                edge_key: frozen.edge_key.clone(),
                children: frozen.children.iter().cloned().collect(),
                parent: frozen.parent,
                value: frozen.value.clone(),
                version: frozen.version,
                old_info: None,
            };
            if *id == ROOT_ID {
                node.parent = None;
            }
            self.nodes.insert(*id, Arc::new(RwLock::new(node)));
        }
        if !self.nodes.contains_key(&ROOT_ID) {
            self.nodes
                .insert(ROOT_ID, Arc::new(RwLock::new(Node::new_root(ROOT_ID))));
        }
        self.bump_id_counter(max_id);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Rebuilds the node table from the on-disk snapshot format (spec.md §3
    /// "Snapshot file (C5)": each record carries only a `children: [id...]`
    /// list, not a token). Relinking `children` into the first-token-keyed
    /// map therefore requires looking at each *child's own* `edge_key[0]`
    /// (spec.md §4.3 "Recovery": "using the child's first edge token as the
    /// map key"), which is why this differs from [`Self::rebuild_from_records`]
    /// (used for the in-memory `old_info` representation, which already
    /// carries tokens).
    pub fn rebuild_from_snapshot(
        &self,
        records: Vec<(NodeId, Vec<Token>, std::collections::HashMap<WorkerId, Vec<SlotId>>, Vec<NodeId>, u64)>,
    ) {
        self.nodes.clear();
        let mut edge_first_token: std::collections::HashMap<NodeId, Option<Token>> = std::collections::HashMap::new();
        for (id, edge_key, ..) in &records {
            edge_first_token.insert(*id, edge_key.first().copied());
        }

        let mut max_id = ROOT_ID;
        let mut built = std::collections::HashMap::new();
        for (id, edge_key, value, child_ids, version) in &records {
            max_id = max_id.max(*id);
            let mut children = std::collections::HashMap::new();
            for child_id in child_ids {
                if let Some(Some(tok)) = edge_first_token.get(child_id) {
                    children.insert(*tok, *child_id);
                }
            }
            let node = Node {
                id: *id,
                edge_key: edge_key.clone(),
                children,
                parent: None,
                value: value.clone(),
                version: *version,
                old_info: None,
            };
            built.insert(*id, node);
        }
        // second pass: set parent back-references now that every node exists
        let mut parent_of: std::collections::HashMap<NodeId, NodeId> = std::collections::HashMap::new();
        for (id, node) in &built {
            for child_id in node.children.values() {
                parent_of.insert(*child_id, *id);
            }
        }
        for (id, node) in built {
            let mut node = node;
            if id != ROOT_ID {
                node.parent = parent_of.get(&id).copied();
            }
            self.nodes.insert(id, Arc::new(RwLock::new(node)));
        }
        if !self.nodes.contains_key(&ROOT_ID) {
            self.nodes
                .insert(ROOT_ID, Arc::new(RwLock::new(Node::new_root(ROOT_ID))));
        }
        self.bump_id_counter(max_id);
    }

    /// Rebuilds the node table from a worker's dict-shaped tree blob fetched
    /// over `GET /v1/radixtree/full` (spec.md §4.6 "Restart"), mirroring
    /// `original_source/Sentry/KvCacheIndex/radix_tree.py::_build_tree_from_dict`:
    /// recursively instantiate each node, then relink it into its parent's
    /// `children` map keyed by the node's own first edge token.
    pub fn rebuild_from_dict(&self, root: &RadixTreeNodeDto) {
        self.nodes.clear();
        let mut next_id = ROOT_ID;
        self.insert_dict_subtree(root, ROOT_ID, None, &mut next_id);
        self.bump_id_counter(next_id);
    }

    fn insert_dict_subtree(&self, dto: &RadixTreeNodeDto, id: NodeId, parent: Option<NodeId>, next_id: &mut NodeId) {
        let mut children = std::collections::HashMap::new();
        let mut child_nodes = Vec::with_capacity(dto.children.len());
        for child_dto in &dto.children {
            *next_id += 1;
            let child_id = *next_id;
            if let Some(first) = child_dto.edge_key.first() {
                children.insert(*first, child_id);
            }
            child_nodes.push((child_id, child_dto));
        }

        let node = Node {
            id,
            edge_key: dto.edge_key.clone(),
            children,
            parent,
            value: dto.value.clone(),
            version: 0,
            old_info: None,
        };
        self.nodes.insert(id, Arc::new(RwLock::new(node)));

        for (child_id, child_dto) in child_nodes {
            self.insert_dict_subtree(child_dto, child_id, Some(id), next_id);
        }
    }
}

impl Default for TreeCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(xs: &[u32]) -> Vec<Token> {
        xs.iter().map(|x| Token(*x)).collect()
    }

    fn slots(xs: &[i64]) -> Vec<SlotId> {
        xs.iter().map(|x| SlotId(*x)).collect()
    }

    #[test]
    fn rebuild_from_dict_relinks_children_by_first_edge_token() {
        let w1 = WorkerId::from("w1");
        let mut w1_value = std::collections::HashMap::new();
        w1_value.insert(w1.clone(), slots(&[1, 2]));

        let dto = RadixTreeNodeDto {
            edge_key: vec![],
            value: std::collections::HashMap::new(),
            children: vec![RadixTreeNodeDto {
                edge_key: toks(&[1, 2]),
                value: w1_value,
                children: vec![RadixTreeNodeDto {
                    edge_key: toks(&[3]),
                    value: std::collections::HashMap::new(),
                    children: vec![],
                }],
            }],
        };

        let core = TreeCore::new();
        core.rebuild_from_dict(&dto);

        assert_eq!(core.node_count(), 3);
        let found = core.search_instances_with_prefix(&toks(&[1, 2]));
        assert!(found.contains(&w1));

        let grandchild_id = core.get(ROOT_ID).unwrap().read().children[&Token(1)];
        let grandchild = core.get(grandchild_id).unwrap();
        let grandchild = grandchild.read();
        assert_eq!(grandchild.edge_key, toks(&[1, 2]));
        assert_eq!(grandchild.parent, Some(ROOT_ID));
        let leaf_id = grandchild.children[&Token(3)];
        let leaf = core.get(leaf_id).unwrap();
        assert_eq!(leaf.read().parent, Some(grandchild_id));
    }
}
