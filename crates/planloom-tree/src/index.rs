//! Parent-indexed outline map.
//!
//! The OutlineIndex holds every loaded node plus, per parent, the list of
//! child ids sorted by `(position, id)`. The child lists are maintained
//! incrementally: changing a node's parent or position moves exactly one id
//! between (or within) lists, with no full rescan.

use std::collections::{HashMap, HashSet, VecDeque};

use planloom_types::{FieldValue, Node, NodeId};

use crate::{Result, TreeError};

/// Default bound on parent-chain hops. Anything deeper is treated as a cycle
/// or corruption.
pub const MAX_DEPTH: usize = 512;

/// Nodes plus sorted per-parent child lists.
#[derive(Debug, Clone)]
pub struct OutlineIndex {
    /// All nodes indexed by ID.
    nodes: HashMap<NodeId, Node>,
    /// Child ids per parent (`None` = roots), sorted by position then id.
    children: HashMap<Option<NodeId>, Vec<NodeId>>,
    /// Hop bound for parent-chain walks.
    max_depth: usize,
}

impl Default for OutlineIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl OutlineIndex {
    pub fn new() -> Self {
        Self::with_max_depth(MAX_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            max_depth,
        }
    }

    /// Build an index from a set of nodes.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut index = Self::new();
        for node in nodes {
            index.insert(node);
        }
        index
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Insert or replace a node. Returns the previous version, if any.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        let previous = self.remove(&node.id);
        let id = node.id;
        let parent = node.parent_id;
        self.nodes.insert(id, node);
        self.link(parent, id);
        previous
    }

    /// Remove a node. Its children keep their `parent_id` and stay indexed
    /// under it.
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.unlink(node.parent_id, id);
        Some(node)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.children.clear();
    }

    /// Write one field, keeping child lists sorted. Returns the old value.
    pub fn set_field(&mut self, id: &NodeId, value: FieldValue) -> Result<FieldValue> {
        let node = self.nodes.get_mut(id).ok_or(TreeError::NotFound(*id))?;
        let old_parent = node.parent_id;
        let relinks = matches!(value, FieldValue::ParentId(_) | FieldValue::Position(_));
        let previous = node.get(value.field());
        node.set(value);
        let new_parent = node.parent_id;

        if relinks {
            self.unlink(old_parent, id);
            self.link(new_parent, *id);
        }
        Ok(previous)
    }

    // =========================================================================
    // Sibling lists
    // =========================================================================

    fn sort_key(&self, id: &NodeId) -> (f64, NodeId) {
        let position = self.nodes.get(id).map(|n| n.position).unwrap_or(f64::MAX);
        (position, *id)
    }

    fn link(&mut self, parent: Option<NodeId>, id: NodeId) {
        let (position, _) = self.sort_key(&id);
        let mut list = self.children.remove(&parent).unwrap_or_default();
        let at = list.partition_point(|other| {
            let (p, oid) = self.sort_key(other);
            p.total_cmp(&position).then(oid.cmp(&id)).is_lt()
        });
        list.insert(at, id);
        self.children.insert(parent, list);
    }

    fn unlink(&mut self, parent: Option<NodeId>, id: &NodeId) {
        if let Some(list) = self.children.get_mut(&parent) {
            list.retain(|c| c != id);
            if list.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    /// Children of `parent` in display order (`None` = roots).
    pub fn children(&self, parent: Option<NodeId>) -> &[NodeId] {
        self.children.get(&parent).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Root nodes in display order.
    pub fn roots(&self) -> &[NodeId] {
        self.children(None)
    }

    fn sibling_slot(&self, id: &NodeId) -> Result<(&[NodeId], usize)> {
        let node = self.nodes.get(id).ok_or(TreeError::NotFound(*id))?;
        let siblings = self.children(node.parent_id);
        let idx = siblings
            .iter()
            .position(|s| s == id)
            .ok_or(TreeError::NotFound(*id))?;
        Ok((siblings, idx))
    }

    /// The sibling displayed immediately before `id`.
    pub fn previous_sibling(&self, id: &NodeId) -> Result<Option<NodeId>> {
        let (siblings, idx) = self.sibling_slot(id)?;
        Ok(idx.checked_sub(1).map(|i| siblings[i]))
    }

    /// The sibling displayed immediately after `id`.
    pub fn next_sibling(&self, id: &NodeId) -> Result<Option<NodeId>> {
        let (siblings, idx) = self.sibling_slot(id)?;
        Ok(siblings.get(idx + 1).copied())
    }

    /// Pairs of adjacent siblings under `parent` that share a position.
    pub fn duplicate_positions(&self, parent: Option<NodeId>) -> Vec<(NodeId, NodeId)> {
        self.children(parent)
            .windows(2)
            .filter(|w| {
                let a = self.nodes.get(&w[0]).map(|n| n.position);
                let b = self.nodes.get(&w[1]).map(|n| n.position);
                a.is_some() && a == b
            })
            .map(|w| (w[0], w[1]))
            .collect()
    }

    // =========================================================================
    // Parent-chain walks
    // =========================================================================

    /// Depth derived from the parent chain (0 for roots).
    ///
    /// Fails with `DepthExceeded` past `max_depth` hops, and with `NotFound`
    /// when the chain references a node that is not indexed.
    pub fn depth(&self, id: &NodeId) -> Result<u32> {
        Ok(self.ancestors(id)?.len() as u32)
    }

    /// Ancestors from immediate parent up to the root.
    pub fn ancestors(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut current = self.nodes.get(id).ok_or(TreeError::NotFound(*id))?;

        while let Some(parent_id) = current.parent_id {
            if result.len() >= self.max_depth {
                tracing::warn!(node = %id, max = self.max_depth, "ancestors() hit depth bound");
                return Err(TreeError::DepthExceeded {
                    node: *id,
                    max: self.max_depth,
                });
            }
            result.push(parent_id);
            current = self
                .nodes
                .get(&parent_id)
                .ok_or(TreeError::NotFound(parent_id))?;
        }

        Ok(result)
    }

    /// Check if `candidate` lies strictly inside the subtree of `root`.
    ///
    /// Walks up from `candidate`, so the cost is its depth, not the subtree
    /// size. A chain that loops or runs past the bound counts as inside: it
    /// can't be proven safe.
    pub fn is_descendant(&self, candidate: &NodeId, root: &NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut current = self.nodes.get(candidate).and_then(|n| n.parent_id);

        while let Some(id) = current {
            if id == *root {
                return true;
            }
            if !visited.insert(id) || visited.len() > self.max_depth {
                tracing::warn!(node = %candidate, "parent chain loops or exceeds bound");
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent_id);
        }
        false
    }

    /// All descendants of `root` in pre-order with their depth relative to
    /// `root` (children are 1).
    ///
    /// Circuit-breaks at `max_depth` levels and on revisits.
    pub fn descendants(&self, root: &NodeId) -> Vec<(NodeId, u32)> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([*root]);
        let mut stack: Vec<(NodeId, u32)> =
            self.children(Some(*root)).iter().rev().map(|c| (*c, 1)).collect();

        while let Some((id, rel)) = stack.pop() {
            if !visited.insert(id) {
                continue; // cycle
            }
            if rel as usize > self.max_depth {
                tracing::warn!(root = %root, "descendants() hit depth bound, truncating");
                break;
            }
            result.push((id, rel));
            for child in self.children(Some(id)).iter().rev() {
                stack.push((*child, rel + 1));
            }
        }

        result
    }

    /// Iterate nodes in display order (depth-first, siblings by position).
    ///
    /// Returns (depth, node) pairs where depth is 0 for roots.
    pub fn iter_dfs(&self) -> impl Iterator<Item = (u32, &Node)> {
        DfsIterator::new(self)
    }
}

/// Depth-first iterator over the outline in display order.
///
/// Tracks visited nodes to protect against cycles.
struct DfsIterator<'a> {
    index: &'a OutlineIndex,
    stack: VecDeque<(u32, NodeId)>,
    visited: HashSet<NodeId>,
}

impl<'a> DfsIterator<'a> {
    fn new(index: &'a OutlineIndex) -> Self {
        let stack = index.roots().iter().map(|id| (0, *id)).collect();
        Self {
            index,
            stack,
            visited: HashSet::new(),
        }
    }
}

impl<'a> Iterator for DfsIterator<'a> {
    type Item = (u32, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((depth, id)) = self.stack.pop_front() {
            if !self.visited.insert(id) {
                continue; // already visited (cycle)
            }
            if let Some(node) = self.index.nodes.get(&id) {
                for child in self.index.children(Some(id)).iter().rev() {
                    self.stack.push_front((depth + 1, *child));
                }
                return Some((depth, node));
            }
        }
        None
    }
}
