//! Boundary marker policy.
//!
//! When editing resumes in a node after a long idle gap, a
//! [`ContentBlock::Boundary`] marker carrying the current time is appended
//! to its content so the stream records when the new burst of writing
//! started. Each node group runs a small state machine:
//!
//! ```text
//! Idle ──begin_insert──▶ Pending ──record_edit──▶ Idle (marker kept)
//!                           │
//!                           └──commit_discard / abandon──▶ Idle (marker gone)
//! ```
//!
//! A discarded marker is removed together with the empty placeholder
//! paragraph it introduced, and the group's timestamps are put back as if
//! the marker never happened. Discards are applied with
//! [`ChangeSource::BoundaryDiscard`](planloom_types::ChangeSource), which the
//! change log never records.

use std::collections::HashMap;

use parking_lot::Mutex;

use planloom_types::{ContentBlock, FieldPatch, FieldValue, MutationPlan, Node, NodeId};

use crate::schedule::SharedClock;

/// Markers are tracked per node.
pub type GroupId = NodeId;

/// Externally visible state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Idle,
    /// A marker was inserted and no real edit has followed yet.
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct PendingMarker {
    at_ms: u64,
    placeholder_added: bool,
    prior_marker_at: Option<u64>,
    prior_edit_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupState {
    last_marker_at: Option<u64>,
    last_edit_at: Option<u64>,
    pending: Option<PendingMarker>,
}

/// Decides when to insert and when to discard boundary markers.
pub struct TimestampPolicy {
    clock: SharedClock,
    threshold_ms: u64,
    groups: Mutex<HashMap<GroupId, GroupState>>,
}

impl TimestampPolicy {
    pub fn new(clock: SharedClock, threshold_ms: u64) -> Self {
        Self {
            clock,
            threshold_ms,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// True if the group never had a marker, or has been idle longer than the
    /// threshold since its last edit.
    pub fn should_insert(&self, group: GroupId) -> bool {
        let now = self.clock.now_millis();
        let groups = self.groups.lock();
        let Some(state) = groups.get(&group) else {
            return true;
        };
        match (state.last_marker_at, state.last_edit_at) {
            (None, _) => true,
            (Some(_), Some(edit)) => now.saturating_sub(edit) > self.threshold_ms,
            (Some(marker), None) => now.saturating_sub(marker) > self.threshold_ms,
        }
    }

    pub fn phase(&self, group: GroupId) -> GroupPhase {
        match self.groups.lock().get(&group) {
            Some(state) if state.pending.is_some() => GroupPhase::Pending,
            _ => GroupPhase::Idle,
        }
    }

    /// Marker plan for `node` if one is due, moving the group to Pending.
    ///
    /// Appends the marker plus an empty placeholder paragraph, unless the
    /// content already ends in one. Returns `None` when no marker is due or
    /// one is already pending.
    pub fn begin_insert(&self, node: &Node) -> Option<MutationPlan> {
        if !self.should_insert(node.id) {
            return None;
        }
        let now = self.clock.now_millis();
        let mut groups = self.groups.lock();
        let state = groups.entry(node.id).or_default();
        if state.pending.is_some() {
            return None;
        }

        let mut content = node.content.clone();
        content.push(ContentBlock::Boundary { at_ms: now });
        let placeholder_added = !node.content.last().is_some_and(ContentBlock::is_empty_paragraph);
        if placeholder_added {
            content.push(ContentBlock::paragraph(""));
        }

        state.pending = Some(PendingMarker {
            at_ms: now,
            placeholder_added,
            prior_marker_at: state.last_marker_at,
            prior_edit_at: state.last_edit_at,
        });
        state.last_marker_at = Some(now);
        state.last_edit_at = Some(now);

        tracing::debug!(node = %node.id, at_ms = now, "boundary marker pending");
        Some(MutationPlan::from_patches(vec![FieldPatch::against(
            node,
            FieldValue::Content(content),
        )]))
    }

    /// A real content edit happened in `group`. Confirms a pending marker.
    ///
    /// Returns `true` if a marker was confirmed.
    pub fn record_edit(&self, group: GroupId) -> bool {
        let now = self.clock.now_millis();
        let mut groups = self.groups.lock();
        let state = groups.entry(group).or_default();
        state.last_edit_at = Some(now);
        let confirmed = state.pending.take().is_some();
        if confirmed {
            tracing::debug!(node = %group, "boundary marker confirmed");
        }
        confirmed
    }

    /// Plan removing the pending marker from `node`.
    ///
    /// Leaves the group Pending; call [`commit_discard`](Self::commit_discard)
    /// once the plan has been applied. Returns `None` if nothing is pending, or
    /// if the marker is no longer in the content.
    pub fn removal_plan(&self, node: &Node) -> Option<MutationPlan> {
        let pending = self.groups.lock().get(&node.id)?.pending?;

        let at = node
            .content
            .iter()
            .position(|b| matches!(b, ContentBlock::Boundary { at_ms } if *at_ms == pending.at_ms))?;
        let mut content = node.content.clone();
        content.remove(at);
        if pending.placeholder_added && content.get(at).is_some_and(ContentBlock::is_empty_paragraph) {
            content.remove(at);
        }

        Some(MutationPlan::from_patches(vec![FieldPatch::against(
            node,
            FieldValue::Content(content),
        )]))
    }

    /// The removal plan for `group` committed. Moves it back to Idle with its
    /// previous timestamps restored.
    ///
    /// Returns `true` if a marker was pending.
    pub fn commit_discard(&self, group: GroupId) -> bool {
        let Some(pending) = self.revert(group) else {
            return false;
        };
        tracing::debug!(node = %group, at_ms = pending.at_ms, "boundary marker discarded");
        true
    }

    /// Revert a pending marker whose plan never committed.
    pub fn abandon(&self, group: GroupId) {
        if self.revert(group).is_some() {
            tracing::debug!(node = %group, "boundary marker abandoned");
        }
    }

    fn revert(&self, group: GroupId) -> Option<PendingMarker> {
        let mut groups = self.groups.lock();
        let state = groups.get_mut(&group)?;
        let pending = state.pending.take()?;
        state.last_marker_at = pending.prior_marker_at;
        state.last_edit_at = pending.prior_edit_at;
        Some(pending)
    }

    /// Groups with a marker awaiting confirmation.
    pub fn pending_groups(&self) -> Vec<GroupId> {
        let mut pending: Vec<GroupId> = self
            .groups
            .lock()
            .iter()
            .filter(|(_, state)| state.pending.is_some())
            .map(|(id, _)| *id)
            .collect();
        pending.sort();
        pending
    }

    /// Drop all state for a group (the node was deleted).
    pub fn forget(&self, group: GroupId) {
        self.groups.lock().remove(&group);
    }

    pub fn clear(&self) {
        self.groups.lock().clear();
    }
}
