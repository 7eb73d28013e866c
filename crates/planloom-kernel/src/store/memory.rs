//! In-memory store backends.
//!
//! Used for tests and ephemeral outlines. All data is lost when dropped.
//! [`MemoryNodeStore`] carries fault injection and call counters so tests can
//! drive rollbacks and observe single-flight loads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use planloom_types::{ChangeLogEntry, EntryId, Node, NodeId, PartialNode};

use super::{HistoryFilter, HistoryStats, HistoryStore, NodeFilter, NodeStore, StoreResult};
use crate::error::PersistenceError;

/// In-memory node store.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// Remaining write calls that should fail.
    fail_writes: AtomicUsize,
    loads: AtomicUsize,
    writes: AtomicUsize,
    load_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `nodes`.
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let store = Self::new();
        {
            let mut map = store.nodes.write();
            for node in nodes {
                map.insert(node.id, node);
            }
        }
        store
    }

    /// Make the next `n` write calls fail with `PersistenceError::Backend`.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of `get_node_by_id` calls served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of write calls that reached the store (failed ones included).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delay every `get_node_by_id` call, so concurrent loads overlap.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    /// Delay every write call before it takes effect.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Stored copy of a node, bypassing counters and delays.
    pub fn stored(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    async fn begin_write(&self) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tracing::debug!("memory store: injected write failure");
            return Err(PersistenceError::backend("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn create_node(&self, node: &Node) -> StoreResult<Node> {
        self.begin_write().await?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(PersistenceError::AlreadyExists(node.id));
        }
        nodes.insert(node.id, node.clone());
        Ok(node.clone())
    }

    async fn update_node(&self, id: NodeId, fields: &PartialNode, _skip_sync: bool) -> StoreResult<Node> {
        self.begin_write().await?;
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(&id).ok_or(PersistenceError::NotFound(id))?;
        for value in fields.values() {
            node.set(value.clone());
        }
        Ok(node.clone())
    }

    async fn batch_update_nodes(&self, batch: &[Node], _skip_sync: bool) -> StoreResult<()> {
        self.begin_write().await?;
        let mut nodes = self.nodes.write();
        if let Some(missing) = batch.iter().find(|n| !nodes.contains_key(&n.id)) {
            return Err(PersistenceError::NotFound(missing.id));
        }
        for node in batch {
            nodes.insert(node.id, node.clone());
        }
        Ok(())
    }

    async fn delete_node(&self, id: NodeId, _skip_sync: bool) -> StoreResult<()> {
        self.begin_write().await?;
        self.nodes
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(PersistenceError::NotFound(id))
    }

    async fn query_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let nodes = self.nodes.read();
        let mut items: Vec<Node> = nodes.values().filter(|n| filter.matches(n)).cloned().collect();
        items.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get_node_by_id(&self, id: NodeId) -> StoreResult<Option<Node>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.nodes.read().get(&id).cloned())
    }
}

/// In-memory change log, kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<ChangeLogEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_entry(&self, entry: &ChangeLogEntry) -> StoreResult<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn query_entries(&self, filter: &HistoryFilter) -> StoreResult<Vec<ChangeLogEntry>> {
        let mut matched: Vec<ChangeLogEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        matched.sort_by_key(|e| e.timestamp);
        Ok(matched)
    }

    async fn delete_entry(&self, id: EntryId) -> StoreResult<bool> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    async fn get_stats(&self) -> StoreResult<HistoryStats> {
        let entries = self.entries.read();
        let mut stats = HistoryStats {
            total: entries.len(),
            ..HistoryStats::default()
        };
        for entry in entries.iter() {
            *stats.by_operation.entry(entry.operation).or_default() += 1;
            stats.oldest = Some(stats.oldest.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            stats.newest = Some(stats.newest.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }
        Ok(stats)
    }
}
