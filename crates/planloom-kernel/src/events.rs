//! Node change notifications.
//!
//! Editing surfaces subscribe to the coordinator and refresh whatever they
//! display when an event names a node they show.

use planloom_types::{ChangeSource, NodeId};

/// Events broadcast after the cache changes.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// A plan was applied and persisted.
    Committed {
        node_ids: Vec<NodeId>,
        source: ChangeSource,
    },
    /// A node was created and persisted.
    Created {
        node_id: NodeId,
        parent_id: Option<NodeId>,
    },
    /// A node was deleted and the deletion persisted.
    Deleted {
        node_id: NodeId,
        parent_id: Option<NodeId>,
    },
    /// Persistence failed; the listed nodes were restored.
    RolledBack { node_ids: Vec<NodeId>, error: String },
}

impl NodeEvent {
    /// Check if this event concerns `id`.
    pub fn touches(&self, id: &NodeId) -> bool {
        match self {
            Self::Committed { node_ids, .. } | Self::RolledBack { node_ids, .. } => node_ids.contains(id),
            Self::Created { node_id, .. } | Self::Deleted { node_id, .. } => node_id == id,
        }
    }
}
