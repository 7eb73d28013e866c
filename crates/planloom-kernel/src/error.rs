//! Error types for the outline runtime.

use thiserror::Error;

use planloom_tree::TreeError;
use planloom_types::{CommandError, NodeId};

use crate::config::ConfigError;

/// A NodeStore or HistoryStore call failed.
///
/// `Clone` so a single in-flight load can hand the same failure to every
/// waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The store has no record of this node.
    #[error("node not found in store: {0:?}")]
    NotFound(NodeId),

    /// A create collided with an existing record.
    #[error("node already exists in store: {0:?}")]
    AlreadyExists(NodeId),

    /// Store is closed or not reachable.
    #[error("storage unavailable")]
    Unavailable,
}

impl PersistenceError {
    /// Create a Backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Public error taxonomy of the outline.
#[derive(Debug, Error)]
pub enum OutlineError {
    /// Sibling order corrupted or numeric resolution exhausted. Recoverable by
    /// renumbering the siblings.
    #[error("consistency: {0}")]
    Consistency(String),

    /// Reparent target lies inside the moved subtree.
    #[error("cannot move {node:?} under {target:?}: target is inside its own subtree")]
    Cycle { node: NodeId, target: NodeId },

    /// Unknown node id.
    #[error("node not found: {0:?}")]
    NotFound(NodeId),

    /// A store call failed before anything was applied to the cache.
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    /// A store call failed after the cache was updated; the cache has been
    /// restored.
    #[error("rolled back {} node(s): {source}", .nodes.len())]
    Rollback {
        source: PersistenceError,
        nodes: Vec<NodeId>,
    },

    /// Command rejected at the boundary.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Only leaves can be deleted.
    #[error("node {0:?} still has children")]
    HasChildren(NodeId),

    /// A precomputed plan no longer matches the cached state of this node.
    #[error("plan is stale for node {0:?}")]
    StalePlan(NodeId),

    /// Configuration rejected at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Called after `dispose()`.
    #[error("outline has been disposed")]
    Disposed,

    /// Broken internal invariant. Never silently absorbed.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl OutlineError {
    /// Create an Invariant error, logging it at `error!`.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "outline invariant violated");
        Self::Invariant(msg)
    }

    /// Check if a renumbering pass could resolve this error.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency(_))
    }
}

impl From<TreeError> for OutlineError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::Consistency { .. } => Self::Consistency(err.to_string()),
            TreeError::Cycle { node, target } => Self::Cycle { node, target },
            TreeError::NotFound(id) => Self::NotFound(id),
            TreeError::DepthExceeded { .. } => Self::invariant(err.to_string()),
        }
    }
}

impl From<CommandError> for OutlineError {
    fn from(err: CommandError) -> Self {
        Self::InvalidCommand(err.to_string())
    }
}

/// Result type for outline operations.
pub type Result<T> = std::result::Result<T, OutlineError>;
