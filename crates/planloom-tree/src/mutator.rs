//! Pure tree mutations.
//!
//! Every operation here reads an [`OutlineIndex`] and returns a
//! [`MutationPlan`]; nothing is written. Callers can inspect or discard a
//! plan freely, and applying it is the coordinator's job.

use planloom_types::{FieldPatch, FieldValue, MutationPlan, NodeId};

use crate::{OutlineIndex, PositionAllocator, Result, TreeError};

/// Computes reparent / indent / outdent / renumber plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeMutator {
    allocator: PositionAllocator,
}

impl TreeMutator {
    pub fn new(allocator: PositionAllocator) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &PositionAllocator {
        &self.allocator
    }

    /// Position for a node placed under `parent` after `after` (or last when
    /// `after` is `None`). `exclude` is left out of the sibling list, so a
    /// node can be repositioned among its current siblings. Placing
    /// `exclude` after itself keeps its current position; under a different
    /// parent that reference is `NotFound`.
    pub fn insertion_position(
        &self,
        index: &OutlineIndex,
        parent: Option<NodeId>,
        after: Option<NodeId>,
        exclude: Option<NodeId>,
    ) -> Result<f64> {
        let siblings: Vec<NodeId> = index
            .children(parent)
            .iter()
            .copied()
            .filter(|id| Some(*id) != exclude)
            .collect();
        let position_of = |id: &NodeId| index.get(id).map(|n| n.position).ok_or(TreeError::NotFound(*id));

        if let Some(reference) = after
            && after == exclude
            && index.children(parent).contains(&reference)
        {
            return position_of(&reference);
        }

        let (before, next) = match after {
            Some(reference) => {
                let slot = siblings
                    .iter()
                    .position(|id| *id == reference)
                    .ok_or(TreeError::NotFound(reference))?;
                (Some(position_of(&siblings[slot])?), siblings.get(slot + 1))
            }
            None => (siblings.last().map(&position_of).transpose()?, None),
        };
        let next = next.map(&position_of).transpose()?;

        self.allocator.allocate_between(before, next)
    }

    /// Move `node_id` under `new_parent`, after `reference_sibling` if given,
    /// else as the last child.
    ///
    /// The plan carries the node's own parent/position/level changes plus a
    /// level change for each descendant whose derived level moves. Every level
    /// in the subtree shifts by the same delta.
    pub fn reparent(
        &self,
        index: &OutlineIndex,
        node_id: NodeId,
        new_parent: Option<NodeId>,
        reference_sibling: Option<NodeId>,
    ) -> Result<MutationPlan> {
        let node = index.get(&node_id).ok_or(TreeError::NotFound(node_id))?;

        if let Some(target) = new_parent {
            if target == node_id || index.is_descendant(&target, &node_id) {
                return Err(TreeError::Cycle {
                    node: node_id,
                    target,
                });
            }
            if !index.contains(&target) {
                return Err(TreeError::NotFound(target));
            }
        }

        let position = self.insertion_position(index, new_parent, reference_sibling, Some(node_id))?;

        let old_level = index.depth(&node_id)?;
        let new_level = match new_parent {
            Some(p) => index.depth(&p)? + 1,
            None => 0,
        };

        let mut plan = MutationPlan::new();
        if node.parent_id != new_parent {
            plan.push(FieldPatch::against(node, FieldValue::ParentId(new_parent)));
        }
        if node.position != position {
            plan.push(FieldPatch::against(node, FieldValue::Position(position)));
        }
        if node.level != new_level {
            plan.push(FieldPatch::against(node, FieldValue::Level(new_level)));
        }

        for (desc_id, rel) in index.descendants(&node_id) {
            let Some(desc) = index.get(&desc_id) else {
                continue;
            };
            let level = new_level + rel;
            if desc.level != level {
                plan.push(FieldPatch::against(desc, FieldValue::Level(level)));
            }
        }

        tracing::debug!(
            node = %node_id,
            old_level,
            new_level,
            patches = plan.len(),
            "reparent plan"
        );
        Ok(plan)
    }

    /// Indent: the node becomes the last child of its previous sibling.
    ///
    /// A first child (or first root) has no previous sibling; the plan is empty.
    pub fn indent(&self, index: &OutlineIndex, node_id: NodeId) -> Result<MutationPlan> {
        match index.previous_sibling(&node_id)? {
            Some(new_parent) => self.reparent(index, node_id, Some(new_parent), None),
            None => {
                tracing::debug!(node = %node_id, "indent: no previous sibling");
                Ok(MutationPlan::empty())
            }
        }
    }

    /// Outdent: the node moves to its grandparent, placed right after its
    /// former parent.
    ///
    /// A root has nowhere to go; the plan is empty.
    pub fn outdent(&self, index: &OutlineIndex, node_id: NodeId) -> Result<MutationPlan> {
        let node = index.get(&node_id).ok_or(TreeError::NotFound(node_id))?;
        let Some(parent_id) = node.parent_id else {
            tracing::debug!(node = %node_id, "outdent: already a root");
            return Ok(MutationPlan::empty());
        };
        let parent = index.get(&parent_id).ok_or(TreeError::NotFound(parent_id))?;
        self.reparent(index, node_id, parent.parent_id, Some(parent_id))
    }

    /// Reassign evenly spaced positions to the children of `parent`, keeping
    /// their current display order.
    pub fn renumber(&self, index: &OutlineIndex, parent: Option<NodeId>) -> MutationPlan {
        let mut plan = MutationPlan::new();
        for (id, position) in index.children(parent).iter().zip(self.allocator.renumbered(usize::MAX)) {
            if let Some(node) = index.get(id)
                && node.position != position
            {
                plan.push(FieldPatch::against(node, FieldValue::Position(position)));
            }
        }
        plan
    }
}
