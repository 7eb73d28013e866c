//! Optimistic transaction coordinator.
//!
//! The coordinator owns the in-memory node cache (an [`OutlineIndex`]) and is
//! the only writer to it. A mutation runs as a [`Transaction`]:
//!
//! 1. `begin` snapshots every node the plan touches
//! 2. the plan is applied to the cache under one write guard, and sibling
//!    positions are validated before the guard is released
//! 3. the changed nodes are sent to the [`NodeStore`](crate::store::NodeStore)
//! 4. on failure, `abort` puts the snapshots back and the caller gets
//!    [`OutlineError::Rollback`]
//!
//! # Concurrency Model
//!
//! - parking_lot `RwLock` around the cache, never held across an await
//! - per-node FIFO write queue (tokio mutexes, acquired in id order), so
//!   overlapping writes to one node commit in the order they were issued
//! - single-flight cold loads: one shared future per node id
//! - `broadcast` channel for change events

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast};

use planloom_tree::OutlineIndex;
use planloom_types::{
    ChangeSource, CreateNodeCommand, FieldPatch, FieldValue, MutationPlan, Node, NodeField, NodeId,
    UpdateNodeCommand,
};

use crate::config::OutlineConfig;
use crate::error::{OutlineError, PersistenceError, Result};
use crate::events::NodeEvent;
use crate::schedule::SharedClock;
use crate::store::{NodeFilter, SharedNodeStore};

type LoadFuture = Shared<BoxFuture<'static, std::result::Result<Option<Node>, PersistenceError>>>;

/// A committed plan with the touched nodes before and after.
#[derive(Debug, Clone)]
pub struct Commit {
    pub plan: MutationPlan,
    pub before: Vec<Node>,
    pub after: Vec<Node>,
    pub source: ChangeSource,
}

impl Commit {
    fn empty(source: ChangeSource) -> Self {
        Self {
            plan: MutationPlan::empty(),
            before: Vec::new(),
            after: Vec::new(),
            source,
        }
    }

    /// Check if nothing was changed (an empty plan).
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.plan.touched_nodes()
    }

    pub fn before_of(&self, id: &NodeId) -> Option<&Node> {
        self.before.iter().find(|n| n.id == *id)
    }

    pub fn after_of(&self, id: &NodeId) -> Option<&Node> {
        self.after.iter().find(|n| n.id == *id)
    }
}

/// Snapshot-based transaction over the cache.
struct Transaction {
    plan: MutationPlan,
    /// Touched nodes as they were at `begin`, in plan order.
    snapshot: Vec<Node>,
}

impl Transaction {
    fn begin(index: &OutlineIndex, plan: MutationPlan) -> Result<Self> {
        let snapshot = plan
            .touched_nodes()
            .into_iter()
            .map(|id| index.get(&id).cloned().ok_or(OutlineError::NotFound(id)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { plan, snapshot })
    }

    fn apply(&self, index: &mut OutlineIndex) -> Result<()> {
        for patch in self.plan.patches() {
            index.set_field(&patch.node_id, patch.new.clone())?;
        }
        Ok(())
    }

    fn abort(&self, index: &mut OutlineIndex) {
        for node in &self.snapshot {
            index.insert(node.clone());
        }
    }

    fn current(&self, index: &OutlineIndex) -> Vec<Node> {
        self.snapshot
            .iter()
            .filter_map(|n| index.get(&n.id).cloned())
            .collect()
    }

    /// First pair of siblings sharing a position where at least one side was
    /// moved by this plan.
    fn sibling_collision(&self, index: &OutlineIndex) -> Option<(NodeId, NodeId)> {
        let moved: HashSet<NodeId> = self
            .plan
            .patches()
            .iter()
            .filter(|p| matches!(p.field(), NodeField::ParentId | NodeField::Position))
            .map(|p| p.node_id)
            .collect();
        if moved.is_empty() {
            return None;
        }

        let mut parents = BTreeSet::new();
        for node in self.snapshot.iter().filter(|n| moved.contains(&n.id)) {
            parents.insert(node.parent_id);
            if let Some(current) = index.get(&node.id) {
                parents.insert(current.parent_id);
            }
        }
        parents.into_iter().find_map(|parent| {
            index
                .duplicate_positions(parent)
                .into_iter()
                .find(|(a, b)| moved.contains(a) || moved.contains(b))
        })
    }
}

/// Write locks held for one mutating call.
#[derive(Default)]
struct WriteQueue {
    held: BTreeMap<NodeId, OwnedMutexGuard<()>>,
}

impl WriteQueue {
    fn holds(&self, id: &NodeId) -> bool {
        self.held.contains_key(id)
    }
}

/// Applies mutation plans optimistically and owns the node cache.
pub struct Coordinator {
    store: SharedNodeStore,
    clock: SharedClock,
    cache: Arc<RwLock<OutlineIndex>>,
    loads: Arc<DashMap<NodeId, LoadFuture>>,
    queues: DashMap<NodeId, Arc<AsyncMutex<()>>>,
    event_tx: broadcast::Sender<NodeEvent>,
    disposed: Arc<AtomicBool>,
    max_depth: usize,
}

/// Shared coordinator handle.
pub type SharedCoordinator = Arc<Coordinator>;

impl Coordinator {
    pub fn new(store: SharedNodeStore, clock: SharedClock, config: &OutlineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            store,
            clock,
            cache: Arc::new(RwLock::new(OutlineIndex::with_max_depth(config.max_depth))),
            loads: Arc::new(DashMap::new()),
            queues: DashMap::new(),
            event_tx,
            disposed: Arc::new(AtomicBool::new(false)),
            max_depth: config.max_depth,
        }
    }

    /// Get the event receiver for subscribing to changes.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(OutlineError::Disposed);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Warm the cache with every stored node. Returns the node count.
    #[tracing::instrument(skip(self), name = "coordinator.init")]
    pub async fn init(&self) -> Result<usize> {
        self.ensure_live()?;
        let nodes = self.store.query_nodes(&NodeFilter::All).await?;
        let count = nodes.len();
        let mut cache = self.cache.write();
        for node in nodes {
            cache.insert(node);
        }
        tracing::info!(count, "outline cache warmed");
        Ok(count)
    }

    /// Drop the cache, in-flight loads and write queues. Every later call
    /// fails with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.write().clear();
        self.loads.clear();
        self.queues.clear();
        tracing::info!("coordinator disposed");
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Cached copy of a node.
    ///
    /// On a miss this starts a background load (when called inside a tokio
    /// runtime) and returns `None` immediately. Use [`load`](Self::load) when
    /// the answer matters.
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        if self.is_disposed() {
            return None;
        }
        if let Some(node) = self.cached(id) {
            return Some(node);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let load = self.load_future(*id);
                let id = *id;
                handle.spawn(async move {
                    if let Err(err) = load.await {
                        tracing::warn!(node = %id, error = %err, "background load failed");
                    }
                });
            }
            Err(_) => tracing::debug!(node = %id, "cache miss outside a runtime, not loading"),
        }
        None
    }

    /// Cached copy without triggering a load.
    pub fn cached(&self, id: &NodeId) -> Option<Node> {
        self.cache.read().get(id).cloned()
    }

    /// Read-through load. Concurrent callers for the same id share one store
    /// request.
    #[tracing::instrument(skip(self), name = "coordinator.load")]
    pub async fn load(&self, id: NodeId) -> Result<Option<Node>> {
        self.ensure_live()?;
        if let Some(node) = self.cached(&id) {
            return Ok(Some(node));
        }
        let load = self.load_future(id);
        Ok(load.await?)
    }

    /// Load a node, failing with `NotFound` if the store has none.
    pub async fn require(&self, id: NodeId) -> Result<Node> {
        self.load(id).await?.ok_or(OutlineError::NotFound(id))
    }

    /// Load a node and every ancestor, so depth can be derived from the cache.
    pub async fn require_chain(&self, id: NodeId) -> Result<()> {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(id) = current {
            if hops > self.max_depth {
                return Err(OutlineError::invariant(format!(
                    "parent chain of {id:?} exceeds {} hops",
                    self.max_depth
                )));
            }
            current = self.require(id).await?.parent_id;
            hops += 1;
        }
        Ok(())
    }

    fn load_future(&self, id: NodeId) -> LoadFuture {
        self.loads
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!(node = %id, "cold load");
                let store = self.store.clone();
                let cache = self.cache.clone();
                let loads = self.loads.clone();
                let disposed = self.disposed.clone();
                async move {
                    let loaded = store.get_node_by_id(id).await;
                    loads.remove(&id);
                    let node = match loaded {
                        Ok(Some(node)) => node,
                        other => return other,
                    };
                    if disposed.load(Ordering::SeqCst) {
                        return Ok(Some(node));
                    }
                    // A write may have landed while the load was in flight;
                    // the cached version wins.
                    let mut cache = cache.write();
                    match cache.get(&id) {
                        Some(current) => Ok(Some(current.clone())),
                        None => {
                            cache.insert(node.clone());
                            Ok(Some(node))
                        }
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Run `f` against a read-only view of the cache.
    pub fn read<R>(&self, f: impl FnOnce(&OutlineIndex) -> R) -> R {
        f(&self.cache.read())
    }

    /// Ids of every cached node.
    pub fn existing_ids(&self) -> HashSet<NodeId> {
        self.cache.read().ids().copied().collect()
    }

    /// Cached children of `parent` in display order.
    pub fn children_of(&self, parent: Option<NodeId>) -> Vec<Node> {
        let cache = self.cache.read();
        cache
            .children(parent)
            .iter()
            .filter_map(|id| cache.get(id).cloned())
            .collect()
    }

    /// Cached nodes in display order with their derived depth.
    pub fn display_order(&self) -> Vec<(u32, Node)> {
        self.cache
            .read()
            .iter_dfs()
            .map(|(depth, node)| (depth, node.clone()))
            .collect()
    }

    // =========================================================================
    // Write queue
    // =========================================================================

    /// Acquire the write locks for `ids` in id order.
    async fn lock_nodes(&self, ids: impl IntoIterator<Item = NodeId>) -> WriteQueue {
        let mut wanted: Vec<NodeId> = ids.into_iter().collect();
        wanted.sort();
        wanted.dedup();
        let mut queue = WriteQueue::default();
        for id in wanted {
            let lock = self.queues.entry(id).or_default().clone();
            queue.held.insert(id, lock.lock_owned().await);
        }
        queue
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a precomputed plan.
    ///
    /// Each patch's `previous` must still match the cache once the write queue
    /// is acquired, else the call fails with `StalePlan` and nothing changes.
    #[tracing::instrument(skip(self, plan), fields(patches = plan.len()), name = "coordinator.apply")]
    pub async fn apply(&self, plan: MutationPlan, source: ChangeSource) -> Result<Commit> {
        self.ensure_live()?;
        plan.validate()?;
        let _queue = self.lock_nodes(plan.touched_nodes()).await;
        self.check_fresh(&plan)?;
        self.commit_locked(plan, source).await
    }

    /// Compute a plan against the cache while holding the write queue, then
    /// apply it.
    ///
    /// `lock` names the nodes expected to be touched. If the computed plan
    /// reaches further, the queue is widened and the plan recomputed.
    pub async fn apply_with<F>(&self, lock: Vec<NodeId>, source: ChangeSource, build: F) -> Result<Commit>
    where
        F: Fn(&OutlineIndex) -> Result<MutationPlan> + Send,
    {
        self.ensure_live()?;
        let mut queue = self.lock_nodes(lock).await;
        let plan = loop {
            let plan = build(&self.cache.read())?;
            let missing: Vec<NodeId> = plan
                .touched_nodes()
                .into_iter()
                .filter(|id| !queue.holds(id))
                .collect();
            if missing.is_empty() {
                break plan;
            }
            tracing::debug!(missing = missing.len(), "plan reaches unlocked nodes, widening write queue");
            // Reacquire the union in id order rather than locking out of order.
            let wanted: Vec<NodeId> = queue.held.keys().copied().chain(missing).collect();
            drop(queue);
            queue = self.lock_nodes(wanted).await;
        };
        plan.validate()?;
        self.commit_locked(plan, source).await
    }

    /// Update non-structural fields. `updated_at` is stamped unless the
    /// command sets it.
    #[tracing::instrument(skip(self, cmd), fields(node = %cmd.node_id), name = "coordinator.update_fields")]
    pub async fn update_fields(&self, cmd: UpdateNodeCommand, source: ChangeSource) -> Result<Commit> {
        self.ensure_live()?;
        cmd.validate()?;
        let node_id = cmd.node_id;
        self.require(node_id).await?;
        let _queue = self.lock_nodes([node_id]).await;

        let now = self.clock.now_millis();
        let plan = {
            let cache = self.cache.read();
            let node = cache.get(&node_id).ok_or(OutlineError::NotFound(node_id))?;
            let mut plan = cmd.into_plan(node);
            if plan.new_value(node_id, NodeField::UpdatedAt).is_none() {
                plan.push(FieldPatch::against(node, FieldValue::UpdatedAt(now)));
            }
            plan
        };
        self.commit_locked(plan, source).await
    }

    /// Insert a node. Its `level` is derived from the parent chain.
    #[tracing::instrument(skip(self, cmd), fields(node = %cmd.node.id), name = "coordinator.create_node")]
    pub async fn create_node(&self, cmd: CreateNodeCommand) -> Result<Node> {
        self.ensure_live()?;
        cmd.validate()?;
        let mut node = cmd.node;
        if let Some(parent) = node.parent_id {
            self.require_chain(parent).await?;
        }
        let _queue = self.lock_nodes(std::iter::once(node.id).chain(node.parent_id)).await;

        {
            let mut cache = self.cache.write();
            if cache.contains(&node.id) {
                return Err(PersistenceError::AlreadyExists(node.id).into());
            }
            node.level = match node.parent_id {
                Some(parent) => cache.depth(&parent)? + 1,
                None => 0,
            };
            let clash = cache
                .children(node.parent_id)
                .iter()
                .filter_map(|id| cache.get(id))
                .find(|sibling| sibling.position == node.position)
                .map(|sibling| sibling.id);
            if let Some(sibling) = clash {
                return Err(OutlineError::Consistency(format!(
                    "position {} already taken by sibling {sibling:?}",
                    node.position
                )));
            }
            cache.insert(node.clone());
        }

        if let Err(err) = self.store.create_node(&node).await {
            if !self.is_disposed() {
                self.cache.write().remove(&node.id);
            }
            return Err(self.rolled_back(err, vec![node.id]));
        }

        tracing::info!(node = %node.id, parent = ?node.parent_id, "node created");
        let _ = self.event_tx.send(NodeEvent::Created {
            node_id: node.id,
            parent_id: node.parent_id,
        });
        Ok(node)
    }

    /// Delete a leaf node. Returns the removed node.
    #[tracing::instrument(skip(self), name = "coordinator.delete_node")]
    pub async fn delete_node(&self, id: NodeId) -> Result<Node> {
        self.ensure_live()?;
        self.require(id).await?;
        let stored_children = self.store.query_nodes(&NodeFilter::Children(Some(id))).await?;
        if !stored_children.is_empty() {
            return Err(OutlineError::HasChildren(id));
        }
        let queue = self.lock_nodes([id]).await;

        let removed = {
            let mut cache = self.cache.write();
            if !cache.children(Some(id)).is_empty() {
                return Err(OutlineError::HasChildren(id));
            }
            cache.remove(&id).ok_or(OutlineError::NotFound(id))?
        };

        if let Err(err) = self.store.delete_node(id, false).await {
            if !self.is_disposed() {
                self.cache.write().insert(removed);
            }
            return Err(self.rolled_back(err, vec![id]));
        }

        drop(queue);
        self.queues.remove(&id);
        tracing::info!(node = %id, "node deleted");
        let _ = self.event_tx.send(NodeEvent::Deleted {
            node_id: id,
            parent_id: removed.parent_id,
        });
        Ok(removed)
    }

    fn check_fresh(&self, plan: &MutationPlan) -> Result<()> {
        let cache = self.cache.read();
        let mut seen = HashSet::new();
        for patch in plan.patches() {
            if !seen.insert((patch.node_id, patch.field())) {
                continue;
            }
            let node = cache
                .get(&patch.node_id)
                .ok_or(OutlineError::NotFound(patch.node_id))?;
            if node.get(patch.field()) != patch.previous {
                tracing::debug!(node = %patch.node_id, field = %patch.field(), "stale plan");
                return Err(OutlineError::StalePlan(patch.node_id));
            }
        }
        Ok(())
    }

    /// Apply, validate and persist a plan. The caller holds the write queue
    /// for every touched node.
    async fn commit_locked(&self, plan: MutationPlan, source: ChangeSource) -> Result<Commit> {
        if plan.is_empty() {
            return Ok(Commit::empty(source));
        }

        let (tx, after) = {
            let mut cache = self.cache.write();
            let tx = Transaction::begin(&cache, plan)?;
            if let Err(err) = tx.apply(&mut cache) {
                tx.abort(&mut cache);
                return Err(err);
            }
            if let Some((a, b)) = tx.sibling_collision(&cache) {
                tx.abort(&mut cache);
                tracing::warn!(?a, ?b, "plan would give siblings the same position");
                return Err(OutlineError::Consistency(format!(
                    "siblings {a:?} and {b:?} would share a position"
                )));
            }
            let after = tx.current(&cache);
            (tx, after)
        };

        let ids: Vec<NodeId> = after.iter().map(|n| n.id).collect();
        let persisted = match after.as_slice() {
            [single] => {
                let fields = single.partial(tx.plan.patches().iter().map(FieldPatch::field));
                self.store.update_node(single.id, &fields, false).await.map(|_| ())
            }
            _ => self.store.batch_update_nodes(&after, false).await,
        };

        if let Err(err) = persisted {
            if !self.is_disposed() {
                tx.abort(&mut self.cache.write());
            }
            return Err(self.rolled_back(err, ids));
        }

        tracing::debug!(nodes = ids.len(), patches = tx.plan.len(), %source, "plan committed");
        let _ = self.event_tx.send(NodeEvent::Committed {
            node_ids: ids,
            source,
        });
        Ok(Commit {
            plan: tx.plan,
            before: tx.snapshot,
            after,
            source,
        })
    }

    fn rolled_back(&self, err: PersistenceError, nodes: Vec<NodeId>) -> OutlineError {
        tracing::warn!(nodes = nodes.len(), error = %err, "persistence failed, cache rolled back");
        let _ = self.event_tx.send(NodeEvent::RolledBack {
            node_ids: nodes.clone(),
            error: err.to_string(),
        });
        OutlineError::Rollback { source: err, nodes }
    }
}
