//! Error types for tree operations.

use thiserror::Error;

use planloom_types::NodeId;

/// Errors raised while computing a tree mutation.
///
/// All of these are pre-commit failures: they are returned before any plan
/// exists, so there is never anything to roll back.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    /// Sibling order is corrupted or numeric resolution is exhausted.
    ///
    /// Recovery is a renumbering pass over the affected siblings.
    #[error("sibling order corrupted: cannot place between {before} and {after}")]
    Consistency { before: f64, after: f64 },

    /// Reparent target is the node itself or one of its descendants.
    #[error("cannot move {node:?} under {target:?}: target is inside its own subtree")]
    Cycle { node: NodeId, target: NodeId },

    /// Node not present in the index.
    #[error("node not found: {0:?}")]
    NotFound(NodeId),

    /// Parent chain did not terminate within the hop bound.
    #[error("parent chain of {node:?} exceeds {max} hops")]
    DepthExceeded { node: NodeId, max: usize },
}
