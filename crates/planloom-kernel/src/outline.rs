//! The outline facade.
//!
//! [`Outline`] is what editing surfaces talk to. It owns one coordinator,
//! change recorder, timestamp policy and autosave buffer, and routes every
//! mutation through the coordinator so the cache has a single writer:
//!
//! | Entry point | Path |
//! |-------------|------|
//! | `create_node`, `insert_node`, `update_fields`, `delete_node` | coordinator, then recorder |
//! | `reparent`, `indent`, `outdent`, `renumber` | tree mutator plan, coordinator, recorder |
//! | `focus`, `blur`, `end_session` | timestamp policy plan, coordinator |
//! | `edit_content`, `flush_due` | autosave buffer, coordinator, recorder |
//!
//! Tree operations read the cached tree. Call [`Outline::init`] before
//! using them on a store that already holds nodes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use planloom_tree::{OutlineIndex, TreeMutator};
use planloom_types::{
    ChangeLogEntry, ChangeSource, ContentBlock, CreateNodeCommand, FieldValue, MutationPlan, Node, NodeId,
    UpdateNodeCommand, boundary_equivalent,
};

use crate::autosave::AutosaveBuffer;
use crate::config::{ConfigError, OutlineConfig};
use crate::coordinator::{Commit, Coordinator, SharedCoordinator};
use crate::error::{OutlineError, Result};
use crate::events::NodeEvent;
use crate::recorder::{ChangeRecorder, CleanupReport, HistoryView};
use crate::schedule::{SharedClock, SharedScheduler, SystemClock, TokioScheduler};
use crate::store::{HistoryStats, SharedHistoryStore, SharedNodeStore};
use crate::timestamp::{GroupPhase, TimestampPolicy};

/// Hierarchical outline with optimistic persistence and an audit log.
pub struct Outline {
    config: OutlineConfig,
    mutator: TreeMutator,
    clock: SharedClock,
    coordinator: SharedCoordinator,
    recorder: ChangeRecorder,
    policy: TimestampPolicy,
    autosave: AutosaveBuffer,
    due_rx: AsyncMutex<mpsc::UnboundedReceiver<NodeId>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Outline {
    pub fn new(
        config: OutlineConfig,
        nodes: SharedNodeStore,
        history: SharedHistoryStore,
        clock: SharedClock,
        scheduler: SharedScheduler,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(Coordinator::new(nodes, clock.clone(), &config));
        let recorder = ChangeRecorder::new(history, clock.clone(), &config);
        let policy = TimestampPolicy::new(clock.clone(), config.boundary_threshold_ms);
        let (autosave, due_rx) = AutosaveBuffer::new(scheduler, config.autosave_debounce());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            mutator: config.mutator(),
            config,
            clock,
            coordinator,
            recorder,
            policy,
            autosave,
            due_rx: AsyncMutex::new(due_rx),
            shutdown_tx,
        })
    }

    /// Outline on the system clock, with timers on the current tokio runtime.
    pub fn with_system_time(config: OutlineConfig, nodes: SharedNodeStore, history: SharedHistoryStore) -> Result<Self> {
        let scheduler = TokioScheduler::current()
            .ok_or_else(|| ConfigError::Invalid("no tokio runtime for the autosave scheduler".into()))?;
        Self::new(config, nodes, history, Arc::new(SystemClock), Arc::new(scheduler))
    }

    pub fn config(&self) -> &OutlineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &SharedCoordinator {
        &self.coordinator
    }

    pub fn recorder(&self) -> &ChangeRecorder {
        &self.recorder
    }

    pub fn policy(&self) -> &TimestampPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.coordinator.subscribe()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.coordinator.is_disposed() {
            return Err(OutlineError::Disposed);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load every stored node into the cache. Returns the node count.
    #[tracing::instrument(skip(self), name = "outline.init")]
    pub async fn init(&self) -> Result<usize> {
        self.coordinator.init().await
    }

    /// Tear down. Buffered edits are dropped, not saved; call
    /// [`end_session`](Self::end_session) first to keep them.
    pub fn dispose(&self) {
        let _ = self.shutdown_tx.send(true);
        self.autosave.clear();
        self.policy.clear();
        self.coordinator.dispose();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Cached node, or `None` while a background load runs.
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.coordinator.get(id)
    }

    pub async fn load(&self, id: NodeId) -> Result<Option<Node>> {
        self.coordinator.load(id).await
    }

    pub fn children(&self, parent: Option<NodeId>) -> Vec<Node> {
        self.coordinator.children_of(parent)
    }

    /// Cached nodes in display order with their depth.
    pub fn display_order(&self) -> Vec<(u32, Node)> {
        self.coordinator.display_order()
    }

    // =========================================================================
    // Node commands
    // =========================================================================

    #[tracing::instrument(skip(self, cmd), fields(node = %cmd.node.id), name = "outline.create_node")]
    pub async fn create_node(&self, cmd: CreateNodeCommand) -> Result<Node> {
        let node = self.coordinator.create_node(cmd).await?;
        if let Err(err) = self.recorder.record_create(&node, ChangeSource::User).await {
            tracing::warn!(node = %node.id, error = %err, "change log write failed");
        }
        Ok(node)
    }

    /// Create a node titled `title` under `parent`, after `after` or as the
    /// last child.
    #[tracing::instrument(skip(self, title), name = "outline.insert_node")]
    pub async fn insert_node(
        &self,
        title: impl Into<String> + Send,
        parent: Option<NodeId>,
        after: Option<NodeId>,
    ) -> Result<Node> {
        self.ensure_live()?;
        if let Some(parent) = parent {
            self.coordinator.require_chain(parent).await?;
        }
        let title = title.into();
        self.with_renumber_retry(parent, || self.insert_once(title.clone(), parent, after))
            .await
    }

    async fn insert_once(&self, title: String, parent: Option<NodeId>, after: Option<NodeId>) -> Result<Node> {
        let position = self
            .coordinator
            .read(|index| self.mutator.insertion_position(index, parent, after, None))?;
        let now = self.clock.now_millis();
        let mut node = Node::new(title, position);
        node.parent_id = parent;
        node.created_at = now;
        node.updated_at = now;
        self.create_node(CreateNodeCommand { node }).await
    }

    #[tracing::instrument(skip(self, cmd), fields(node = %cmd.node_id), name = "outline.update_fields")]
    pub async fn update_fields(&self, cmd: UpdateNodeCommand) -> Result<Commit> {
        let commit = self.coordinator.update_fields(cmd, ChangeSource::User).await?;
        self.record_commit(&commit).await;
        Ok(commit)
    }

    /// Delete a leaf. Buffered edits and marker state for it are dropped.
    #[tracing::instrument(skip(self), name = "outline.delete_node")]
    pub async fn delete_node(&self, id: NodeId) -> Result<Node> {
        let node = self.coordinator.delete_node(id).await?;
        self.autosave.cancel(id);
        self.policy.forget(id);
        if let Err(err) = self.recorder.record_delete(&node, ChangeSource::User).await {
            tracing::warn!(node = %id, error = %err, "change log write failed");
        }
        Ok(node)
    }

    // =========================================================================
    // Tree operations
    // =========================================================================

    /// Move `node_id` under `new_parent`, after `after` or as the last child.
    #[tracing::instrument(skip(self), name = "outline.reparent")]
    pub async fn reparent(&self, node_id: NodeId, new_parent: Option<NodeId>, after: Option<NodeId>) -> Result<Commit> {
        self.ensure_live()?;
        self.coordinator.require_chain(node_id).await?;
        if let Some(parent) = new_parent {
            self.coordinator.require_chain(parent).await?;
        }
        self.with_renumber_retry(new_parent, || {
            self.tree_op(node_id, move |mutator, index| {
                mutator.reparent(index, node_id, new_parent, after)
            })
        })
        .await
    }

    /// Make `node_id` the last child of its previous sibling.
    #[tracing::instrument(skip(self), name = "outline.indent")]
    pub async fn indent(&self, node_id: NodeId) -> Result<Commit> {
        self.ensure_live()?;
        self.coordinator.require_chain(node_id).await?;
        let target = self.coordinator.read(|index| index.previous_sibling(&node_id))?;
        self.with_renumber_retry(target, || {
            self.tree_op(node_id, move |mutator, index| mutator.indent(index, node_id))
        })
        .await
    }

    /// Move `node_id` to its grandparent, right after its former parent.
    #[tracing::instrument(skip(self), name = "outline.outdent")]
    pub async fn outdent(&self, node_id: NodeId) -> Result<Commit> {
        self.ensure_live()?;
        self.coordinator.require_chain(node_id).await?;
        let target = self.coordinator.read(|index| {
            index
                .get(&node_id)
                .and_then(|n| n.parent_id)
                .and_then(|p| index.get(&p))
                .and_then(|p| p.parent_id)
        });
        self.with_renumber_retry(target, || {
            self.tree_op(node_id, move |mutator, index| mutator.outdent(index, node_id))
        })
        .await
    }

    /// Reassign evenly spaced positions to the children of `parent`.
    #[tracing::instrument(skip(self), name = "outline.renumber")]
    pub async fn renumber(&self, parent: Option<NodeId>) -> Result<Commit> {
        self.ensure_live()?;
        let siblings = self.coordinator.read(|index| index.children(parent).to_vec());
        tracing::warn!(?parent, siblings = siblings.len(), "renumbering siblings");
        let mutator = self.mutator;
        let commit = self
            .coordinator
            .apply_with(siblings, ChangeSource::Tree, |index| Ok(mutator.renumber(index, parent)))
            .await?;
        self.record_commit(&commit).await;
        Ok(commit)
    }

    async fn tree_op<B>(&self, node_id: NodeId, build: B) -> Result<Commit>
    where
        B: Fn(&TreeMutator, &OutlineIndex) -> planloom_tree::Result<MutationPlan> + Send,
    {
        let subtree = self.coordinator.read(|index| {
            std::iter::once(node_id)
                .chain(index.descendants(&node_id).into_iter().map(|(id, _)| id))
                .collect::<Vec<_>>()
        });
        let mutator = self.mutator;
        let commit = self
            .coordinator
            .apply_with(subtree, ChangeSource::Tree, move |index| Ok(build(&mutator, index)?))
            .await?;
        self.record_commit(&commit).await;
        Ok(commit)
    }

    /// Run `op`; on a consistency failure renumber `parent`'s children and
    /// run it once more.
    async fn with_renumber_retry<T, F, Fut>(&self, parent: Option<NodeId>, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(err) if err.is_consistency() => {
                tracing::warn!(?parent, error = %err, "sibling order exhausted or corrupted, retrying after renumber");
                self.renumber(parent).await?;
                op().await
            }
            other => other,
        }
    }

    // =========================================================================
    // Editing session
    // =========================================================================

    /// Editing focus entered `node_id`. Inserts a boundary marker if one is
    /// due. Buffered content for the node is flushed first so the marker
    /// lands after it.
    #[tracing::instrument(skip(self), name = "outline.focus")]
    pub async fn focus(&self, node_id: NodeId) -> Result<Option<Commit>> {
        self.ensure_live()?;
        self.flush_node(node_id).await?;
        let node = self.coordinator.require(node_id).await?;
        let Some(plan) = self.policy.begin_insert(&node) else {
            return Ok(None);
        };
        match self.coordinator.apply(plan, ChangeSource::TimestampPolicy).await {
            Ok(commit) => {
                self.record_commit(&commit).await;
                Ok(Some(commit))
            }
            Err(err) => {
                self.policy.abandon(node_id);
                Err(err)
            }
        }
    }

    /// The editor produced new content for `node_id`. Buffered and flushed
    /// after the autosave debounce. Confirms a pending marker when the text
    /// actually changed.
    pub fn edit_content(&self, node_id: NodeId, content: Vec<ContentBlock>) -> Result<()> {
        self.ensure_live()?;
        let base = self
            .autosave
            .peek(node_id)
            .or_else(|| self.coordinator.cached(&node_id).map(|n| n.content));
        let changed = base.is_none_or(|base| !boundary_equivalent(&base, &content));
        self.autosave.stage(node_id, content);
        if changed {
            self.policy.record_edit(node_id);
        }
        Ok(())
    }

    /// Editing focus left `node_id`. Flushes buffered content and removes a
    /// marker nobody wrote after.
    #[tracing::instrument(skip(self), name = "outline.blur")]
    pub async fn blur(&self, node_id: NodeId) -> Result<Option<Commit>> {
        self.ensure_live()?;
        self.flush_node(node_id).await?;
        if self.policy.phase(node_id) != GroupPhase::Pending {
            return Ok(None);
        }
        let node = self.coordinator.require(node_id).await?;
        let Some(plan) = self.policy.removal_plan(&node) else {
            // The marker is already gone from the content.
            self.policy.commit_discard(node_id);
            return Ok(None);
        };
        // BoundaryDiscard is never recorded. On failure the group stays
        // Pending so a later blur retries the removal.
        let commit = self.coordinator.apply(plan, ChangeSource::BoundaryDiscard).await?;
        self.policy.commit_discard(node_id);
        Ok(Some(commit))
    }

    /// Flush every buffered edit and discard every unconfirmed marker.
    /// Returns the nodes whose marker was discarded.
    #[tracing::instrument(skip(self), name = "outline.end_session")]
    pub async fn end_session(&self) -> Result<Vec<NodeId>> {
        self.ensure_live()?;
        for node_id in self.autosave.pending_ids() {
            self.flush_node(node_id).await?;
        }
        let mut discarded = Vec::new();
        for node_id in self.policy.pending_groups() {
            if self.blur(node_id).await?.is_some() {
                discarded.push(node_id);
            }
        }
        tracing::info!(discarded = discarded.len(), "editing session ended");
        Ok(discarded)
    }

    /// Write buffered content for `node_id` now.
    pub async fn flush_node(&self, node_id: NodeId) -> Result<Option<Commit>> {
        let Some(content) = self.autosave.take(node_id) else {
            return Ok(None);
        };
        let cmd = UpdateNodeCommand::new(node_id, vec![FieldValue::Content(content.clone())]);
        match self.coordinator.update_fields(cmd, ChangeSource::Autosave).await {
            Ok(commit) => {
                self.record_commit(&commit).await;
                Ok(Some(commit))
            }
            Err(err) => {
                let retryable = !matches!(err, OutlineError::NotFound(_) | OutlineError::Disposed);
                if retryable && !self.autosave.is_pending(node_id) {
                    self.autosave.stage(node_id, content);
                }
                Err(err)
            }
        }
    }

    /// Flush every node whose debounce has elapsed. Returns how many were
    /// written. Failed flushes stay buffered; the first error is returned
    /// after the rest were tried.
    pub async fn flush_due(&self) -> Result<usize> {
        let mut due = {
            // The background worker owns the receiver while it runs.
            let Ok(mut rx) = self.due_rx.try_lock() else {
                return Ok(0);
            };
            let mut ids = Vec::new();
            while let Ok(id) = rx.try_recv() {
                ids.push(id);
            }
            ids
        };
        due.sort();
        due.dedup();

        let mut flushed = 0;
        let mut first_error = None;
        for node_id in due {
            match self.flush_node(node_id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(node = %node_id, error = %err, "autosave flush failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }

    /// Flush due nodes in the background until [`dispose`](Self::dispose).
    pub fn spawn_autosave_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let outline = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = outline.shutdown_tx.subscribe();
            let mut rx = outline.due_rx.lock().await;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    due = rx.recv() => {
                        let Some(node_id) = due else { break };
                        if let Err(err) = outline.flush_node(node_id).await {
                            tracing::warn!(node = %node_id, error = %err, "autosave flush failed");
                        }
                    }
                }
            }
            tracing::debug!("autosave worker stopped");
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    async fn record_commit(&self, commit: &Commit) {
        if let Err(err) = self.recorder.record_commit(commit).await {
            tracing::warn!(nodes = commit.after.len(), error = %err, "change log write failed");
        }
    }

    /// Which nodes existed at `at`.
    pub async fn existing_nodes_at(&self, at: u64) -> Result<HashSet<NodeId>> {
        self.ensure_live()?;
        self.recorder
            .existing_nodes_at(self.coordinator.existing_ids(), at)
            .await
    }

    /// Change-log entries in `[range_start, range_end]` plus tasks missed in
    /// that range, as of now.
    pub async fn history_view(&self, range_start: u64, range_end: u64) -> Result<HistoryView> {
        self.ensure_live()?;
        let nodes: Vec<Node> = self.coordinator.read(|index| index.nodes().cloned().collect());
        self.recorder
            .history_view(range_start, range_end, self.clock.now_millis(), &nodes)
            .await
    }

    pub async fn node_history(&self, node_id: NodeId) -> Result<Vec<ChangeLogEntry>> {
        self.ensure_live()?;
        self.recorder.node_history(node_id).await
    }

    /// Store a snapshot of the node's current state.
    pub async fn checkin(&self, node_id: NodeId) -> Result<Option<ChangeLogEntry>> {
        self.ensure_live()?;
        let node = self.coordinator.require(node_id).await?;
        self.recorder.checkin(&node, ChangeSource::User).await
    }

    /// Prune the change log as of now.
    pub async fn cleanup_history(&self) -> Result<CleanupReport> {
        self.ensure_live()?;
        self.recorder.cleanup(self.clock.now_millis()).await
    }

    pub async fn history_stats(&self) -> Result<HistoryStats> {
        self.ensure_live()?;
        self.recorder.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ManualClock;
    use crate::store::{MemoryHistoryStore, MemoryNodeStore};

    async fn outline() -> (Arc<ManualClock>, Outline) {
        let clock = Arc::new(ManualClock::new(50_000_000));
        let outline = Outline::new(
            OutlineConfig::default(),
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemoryHistoryStore::new()),
            clock.clone(),
            clock.clone(),
        )
        .unwrap();
        outline.init().await.unwrap();
        (clock, outline)
    }

    #[tokio::test]
    async fn test_edit_without_text_change_leaves_marker_pending() {
        let (_, outline) = outline().await;
        let node = outline.insert_node("log", None, None).await.unwrap();
        outline.focus(node.id).await.unwrap();
        let marked = outline.get(&node.id).unwrap().content;

        // Editors re-emit identical content on selection changes.
        outline.edit_content(node.id, marked.clone()).unwrap();
        assert_eq!(outline.policy().phase(node.id), GroupPhase::Pending);

        let mut typed = marked;
        typed.push(ContentBlock::paragraph("entry"));
        outline.edit_content(node.id, typed).unwrap();
        assert_eq!(outline.policy().phase(node.id), GroupPhase::Idle);
    }

    #[tokio::test]
    async fn test_focus_flushes_buffered_content_first() {
        let (_, outline) = outline().await;
        let node = outline.insert_node("log", None, None).await.unwrap();
        outline
            .edit_content(node.id, vec![ContentBlock::paragraph("draft")])
            .unwrap();

        outline.focus(node.id).await.unwrap();

        let content = outline.get(&node.id).unwrap().content;
        assert_eq!(content[0], ContentBlock::paragraph("draft"));
        assert!(content[1].is_boundary());
    }

    #[tokio::test]
    async fn test_delete_drops_buffered_edit() {
        let (clock, outline) = outline().await;
        let node = outline.insert_node("scratch", None, None).await.unwrap();
        outline
            .edit_content(node.id, vec![ContentBlock::paragraph("gone")])
            .unwrap();

        outline.delete_node(node.id).await.unwrap();
        clock.advance(outline.config().autosave_debounce());

        assert_eq!(outline.flush_due().await.unwrap(), 0);
    }
}
