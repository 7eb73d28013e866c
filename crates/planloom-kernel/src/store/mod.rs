//! Persistence collaborators.
//!
//! The outline never touches bytes on disk itself. Node records go through a
//! [`NodeStore`], audit entries through a [`HistoryStore`]. Both are async
//! traits so a backend can sit on a database, a file, or a network sync
//! layer; the in-memory implementations in [`memory`] back the tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use planloom_types::{ChangeLogEntry, ChangeOperation, EntryId, Node, NodeId, PartialNode};

use crate::error::PersistenceError;

pub mod memory;

pub use memory::{MemoryHistoryStore, MemoryNodeStore};

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Which nodes a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeFilter {
    #[default]
    All,
    /// Direct children of a parent (`None` = roots).
    Children(Option<NodeId>),
    /// A specific set of ids.
    Ids(Vec<NodeId>),
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        match self {
            Self::All => true,
            Self::Children(parent) => node.parent_id == *parent,
            Self::Ids(ids) => ids.contains(&node.id),
        }
    }
}

/// Node persistence.
///
/// `skip_sync` asks the backend not to propagate the write to other
/// surfaces (used for writes that originated from a sync).
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Persist a new node. Fails with `AlreadyExists` on an id collision.
    async fn create_node(&self, node: &Node) -> StoreResult<Node>;

    /// Merge `fields` into a stored node and return the result.
    async fn update_node(&self, id: NodeId, fields: &PartialNode, skip_sync: bool) -> StoreResult<Node>;

    /// Replace several stored nodes at once. All-or-nothing.
    async fn batch_update_nodes(&self, nodes: &[Node], skip_sync: bool) -> StoreResult<()>;

    async fn delete_node(&self, id: NodeId, skip_sync: bool) -> StoreResult<()>;

    async fn query_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>>;

    async fn get_node_by_id(&self, id: NodeId) -> StoreResult<Option<Node>>;
}

/// Shared node store handle.
pub type SharedNodeStore = Arc<dyn NodeStore>;

/// Which change-log entries a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub node_id: Option<NodeId>,
    pub operations: Option<Vec<ChangeOperation>>,
    /// Inclusive lower bound (Unix millis).
    pub since: Option<u64>,
    /// Inclusive upper bound (Unix millis).
    pub until: Option<u64>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id: Some(node_id),
            ..Self::default()
        }
    }

    pub fn with_operations(mut self, operations: impl IntoIterator<Item = ChangeOperation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }

    pub fn with_range(mut self, since: Option<u64>, until: Option<u64>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, entry: &ChangeLogEntry) -> bool {
        self.node_id.is_none_or(|id| entry.node_id == id)
            && self
                .operations
                .as_ref()
                .is_none_or(|ops| ops.contains(&entry.operation))
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

/// Aggregate counts over the change log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub by_operation: BTreeMap<ChangeOperation, usize>,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

/// Append-only audit log persistence.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_entry(&self, entry: &ChangeLogEntry) -> StoreResult<()>;

    /// Matching entries, oldest first.
    async fn query_entries(&self, filter: &HistoryFilter) -> StoreResult<Vec<ChangeLogEntry>>;

    /// Returns `false` if no such entry existed.
    async fn delete_entry(&self, id: EntryId) -> StoreResult<bool>;

    async fn get_stats(&self) -> StoreResult<HistoryStats>;
}

/// Shared history store handle.
pub type SharedHistoryStore = Arc<dyn HistoryStore>;
