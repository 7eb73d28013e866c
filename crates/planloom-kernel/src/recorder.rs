//! Append-only change log.
//!
//! The recorder turns committed mutations into [`ChangeLogEntry`]s. Diffs are
//! restricted to the fields a mutation meant to touch, and a diff whose every
//! difference is noise is dropped before it reaches the [`HistoryStore`]:
//!
//! - fields in [`IGNORED_FIELDS`] (denormalized order, cached level, mtime)
//! - transient UI keys in `metadata` ([`TRANSIENT_METADATA_KEYS`])
//! - content changes that vanish once boundary markers are stripped
//!
//! Retention keeps meaningful entries indefinitely, subject to a hard cap.
//! [`ChangeRecorder::cleanup`] evicts in this order: meaningless, derived,
//! past-window without content, past-window with content, in-window without
//! content, and only then in-window content changes.
//!
//! [`HistoryStore`]: crate::store::HistoryStore

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use planloom_types::{
    ChangeLogEntry, ChangeOperation, ChangeSource, ContentBlock, EntryId, EntryMetadata, FieldChange,
    FieldPatch, FieldValue, MissedEntry, Node, NodeField, NodeId, PartialNode, boundary_equivalent,
};

use crate::config::OutlineConfig;
use crate::coordinator::Commit;
use crate::error::Result;
use crate::schedule::SharedClock;
use crate::store::{HistoryFilter, HistoryStats, SharedHistoryStore};

/// Fields whose changes alone never make an entry.
pub const IGNORED_FIELDS: [NodeField; 3] = [NodeField::Position, NodeField::Level, NodeField::UpdatedAt];

/// Metadata keys that only reflect UI state.
pub const TRANSIENT_METADATA_KEYS: &[&str] = &["collapsed", "selected", "focused", "editing"];

/// Field-level diff of `after` against `before`.
///
/// Only fields present in `after` are compared. A field missing from
/// `before` counts as blank, so `None -> []` is not a change.
pub fn diff(before: &PartialNode, after: &PartialNode) -> Vec<FieldChange> {
    after
        .iter()
        .filter_map(|(field, new)| {
            let old = before.get(field);
            let unchanged = match old {
                Some(old) => old.same_as(new),
                None => new.is_blank(),
            };
            (!unchanged).then(|| FieldChange {
                field: *field,
                old: old.cloned(),
                new: Some(new.clone()),
            })
        })
        .collect()
}

/// Changes describing the removal of every non-blank field in `before`.
fn removal(before: &PartialNode) -> Vec<FieldChange> {
    before
        .iter()
        .filter(|(_, value)| !value.is_blank())
        .map(|(field, value)| FieldChange {
            field: *field,
            old: Some(value.clone()),
            new: None,
        })
        .collect()
}

fn content_of(value: &Option<FieldValue>) -> &[ContentBlock] {
    match value {
        Some(FieldValue::Content(blocks)) => blocks,
        _ => &[],
    }
}

fn stable_metadata(value: &Option<FieldValue>) -> BTreeMap<&str, &serde_json::Value> {
    match value {
        Some(FieldValue::Metadata(map)) => map
            .iter()
            .filter(|(key, _)| !TRANSIENT_METADATA_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.as_str(), value))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Check if a change is worth keeping on its own.
pub fn is_meaningful(change: &FieldChange) -> bool {
    if IGNORED_FIELDS.contains(&change.field) {
        return false;
    }
    match change.field {
        NodeField::Content => !boundary_equivalent(content_of(&change.old), content_of(&change.new)),
        NodeField::Metadata => stable_metadata(&change.old) != stable_metadata(&change.new),
        _ => true,
    }
}

/// Check if no change in the set is meaningful.
pub fn is_meaningless(changes: &[FieldChange]) -> bool {
    !changes.iter().any(is_meaningful)
}

/// Tasks whose planned end fell inside `[range_start, range_end]` and that
/// were still incomplete at `min(now, range_end)`.
pub fn missed_entries<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    range_start: u64,
    range_end: u64,
    now: u64,
) -> Vec<MissedEntry> {
    let cutoff = now.min(range_end);
    let mut missed: Vec<MissedEntry> = nodes
        .into_iter()
        .filter_map(|node| {
            let task = node.task?;
            let planned_end_ms = task.planned_end_ms?;
            let in_range = (range_start..=range_end).contains(&planned_end_ms);
            (in_range && planned_end_ms <= cutoff && task.incomplete_at(cutoff)).then(|| MissedEntry {
                node_id: node.id,
                title: node.title.clone(),
                planned_end_ms,
            })
        })
        .collect();
    missed.sort_by_key(|m| (m.planned_end_ms, m.node_id));
    missed
}

/// Stored entries in a range plus the derived missed tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryView {
    pub entries: Vec<ChangeLogEntry>,
    pub missed: Vec<MissedEntry>,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub meaningless_removed: usize,
    pub derived_removed: usize,
    /// Entries evicted to get under the hard cap.
    pub evicted: usize,
    pub remaining: usize,
}

/// Eviction order, first to go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EvictionClass {
    Meaningless,
    Derived,
    StaleOther,
    StaleContent,
    RecentOther,
    RecentContent,
}

impl EvictionClass {
    fn of(entry: &ChangeLogEntry, window_start: u64) -> Self {
        let diffable = matches!(entry.operation, ChangeOperation::Update | ChangeOperation::Checkin);
        if diffable && is_meaningless(&entry.changes) {
            return Self::Meaningless;
        }
        if entry.metadata.derived {
            return Self::Derived;
        }
        let content = entry.changes.iter().any(|c| c.field == NodeField::Content && is_meaningful(c));
        match (entry.timestamp < window_start, content) {
            (true, false) => Self::StaleOther,
            (true, true) => Self::StaleContent,
            (false, false) => Self::RecentOther,
            (false, true) => Self::RecentContent,
        }
    }
}

/// Records committed mutations into the history store.
pub struct ChangeRecorder {
    history: SharedHistoryStore,
    clock: SharedClock,
    retention_ms: u64,
    max_entries: usize,
    dedup_window_ms: u64,
    /// Last recorded `create` per node, for duplicate suppression.
    recent_creates: DashMap<NodeId, u64>,
}

impl ChangeRecorder {
    pub fn new(history: SharedHistoryStore, clock: SharedClock, config: &OutlineConfig) -> Self {
        Self {
            history,
            clock,
            retention_ms: config.retention_ms(),
            max_entries: config.max_entries,
            dedup_window_ms: config.create_dedup_window_ms,
            recent_creates: DashMap::new(),
        }
    }

    /// Record one mutation. Returns `None` when nothing was written: the
    /// source is never recorded, the create is a duplicate, or the diff is
    /// meaningless.
    #[tracing::instrument(skip_all, fields(node = %node_id, %operation, %source), name = "recorder.record")]
    pub async fn record(
        &self,
        operation: ChangeOperation,
        node_id: NodeId,
        before: PartialNode,
        after: PartialNode,
        source: ChangeSource,
    ) -> Result<Option<ChangeLogEntry>> {
        if !source.is_recorded() {
            tracing::debug!("source is not recorded");
            return Ok(None);
        }
        let now = self.clock.now_millis();

        let changes = match operation {
            ChangeOperation::Create => {
                if self.is_duplicate_create(node_id, now) {
                    tracing::debug!("duplicate create suppressed");
                    return Ok(None);
                }
                diff(&PartialNode::new(), &after)
            }
            ChangeOperation::Delete => removal(&before),
            ChangeOperation::Update | ChangeOperation::Checkin => {
                let changes = diff(&before, &after);
                if is_meaningless(&changes) {
                    tracing::debug!(changes = changes.len(), "meaningless diff dropped");
                    return Ok(None);
                }
                changes
            }
        };

        let entry = ChangeLogEntry {
            id: EntryId::new(),
            node_id,
            operation,
            timestamp: now,
            before,
            after,
            changes,
            source,
            metadata: EntryMetadata::default(),
        };
        if let Err(err) = self.history.create_entry(&entry).await {
            if matches!(operation, ChangeOperation::Create) {
                // A retry of this create is not a duplicate.
                self.recent_creates.remove_if(&node_id, |_, at| *at == now);
            }
            return Err(err.into());
        }
        Ok(Some(entry))
    }

    /// Claims `node_id` in the dedup window. The claim is released again if
    /// the entry fails to persist.
    fn is_duplicate_create(&self, node_id: NodeId, now: u64) -> bool {
        let window = self.dedup_window_ms;
        self.recent_creates.retain(|_, at| now.saturating_sub(*at) < window);
        let mut duplicate = false;
        self.recent_creates
            .entry(node_id)
            .and_modify(|_| duplicate = true)
            .or_insert(now);
        duplicate
    }

    /// Record a node creation with its full initial state.
    pub async fn record_create(&self, node: &Node, source: ChangeSource) -> Result<Option<ChangeLogEntry>> {
        self.record(ChangeOperation::Create, node.id, PartialNode::new(), node.full_partial(), source)
            .await
    }

    /// Record a node deletion with its final state.
    pub async fn record_delete(&self, node: &Node, source: ChangeSource) -> Result<Option<ChangeLogEntry>> {
        self.record(ChangeOperation::Delete, node.id, node.full_partial(), PartialNode::new(), source)
            .await
    }

    /// Record one `update` entry per node of a commit, each restricted to the
    /// fields the plan patched on that node.
    pub async fn record_commit(&self, commit: &Commit) -> Result<Vec<ChangeLogEntry>> {
        if !commit.source.is_recorded() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for after in &commit.after {
            let Some(before) = commit.before_of(&after.id) else {
                continue;
            };
            let fields: Vec<NodeField> = commit.plan.patches_for(after.id).map(FieldPatch::field).collect();
            let recorded = self
                .record(
                    ChangeOperation::Update,
                    after.id,
                    before.partial(fields.iter().copied()),
                    after.partial(fields),
                    commit.source,
                )
                .await?;
            entries.extend(recorded);
        }
        Ok(entries)
    }

    /// Store a full snapshot of `node`, unless it matches the previous
    /// snapshot once noise is ignored.
    #[tracing::instrument(skip(self, node), fields(node = %node.id), name = "recorder.checkin")]
    pub async fn checkin(&self, node: &Node, source: ChangeSource) -> Result<Option<ChangeLogEntry>> {
        let previous = self
            .history
            .query_entries(&HistoryFilter::for_node(node.id).with_operations([ChangeOperation::Checkin]))
            .await?
            .pop();

        let after = node.full_partial();
        let before = previous.as_ref().map(|e| e.after.clone()).unwrap_or_default();
        let changes = diff(&before, &after);
        if previous.is_some() && is_meaningless(&changes) {
            tracing::debug!("checkin matches previous snapshot");
            return Ok(None);
        }

        let entry = ChangeLogEntry {
            id: EntryId::new(),
            node_id: node.id,
            operation: ChangeOperation::Checkin,
            timestamp: self.clock.now_millis(),
            before,
            after,
            changes,
            source,
            metadata: EntryMetadata {
                derived: false,
                best_snapshot: previous.map(|e| e.id),
            },
        };
        self.history.create_entry(&entry).await?;
        Ok(Some(entry))
    }

    /// Store an entry reconstructed after the fact, tagged as derived.
    pub async fn backfill(&self, mut entry: ChangeLogEntry) -> Result<ChangeLogEntry> {
        entry.metadata.derived = true;
        self.history.create_entry(&entry).await?;
        Ok(entry)
    }

    /// Prune the log against the retention window and hard cap.
    #[tracing::instrument(skip(self), name = "recorder.cleanup")]
    pub async fn cleanup(&self, now: u64) -> Result<CleanupReport> {
        let entries = self.history.query_entries(&HistoryFilter::all()).await?;
        let window_start = now.saturating_sub(self.retention_ms);
        let mut report = CleanupReport::default();
        let mut kept = Vec::with_capacity(entries.len());

        for entry in entries {
            let class = EvictionClass::of(&entry, window_start);
            match class {
                EvictionClass::Meaningless => {
                    self.history.delete_entry(entry.id).await?;
                    report.meaningless_removed += 1;
                }
                EvictionClass::Derived if entry.timestamp < window_start => {
                    self.history.delete_entry(entry.id).await?;
                    report.derived_removed += 1;
                }
                _ => kept.push((class, entry)),
            }
        }

        if kept.len() > self.max_entries {
            kept.sort_by_key(|(class, entry)| (*class, entry.timestamp));
            let over = kept.len() - self.max_entries;
            for (_, entry) in kept.drain(..over) {
                self.history.delete_entry(entry.id).await?;
                report.evicted += 1;
            }
        }
        report.remaining = kept.len();

        tracing::info!(
            meaningless = report.meaningless_removed,
            derived = report.derived_removed,
            evicted = report.evicted,
            remaining = report.remaining,
            "change log cleanup"
        );
        Ok(report)
    }

    /// Entries for one node, oldest first.
    pub async fn node_history(&self, node_id: NodeId) -> Result<Vec<ChangeLogEntry>> {
        Ok(self.history.query_entries(&HistoryFilter::for_node(node_id)).await?)
    }

    /// Which nodes existed at `at`, starting from the ids that exist now.
    ///
    /// Nodes deleted after `at` are added back; nodes created after `at` are
    /// removed.
    pub async fn existing_nodes_at(
        &self,
        current: impl IntoIterator<Item = NodeId>,
        at: u64,
    ) -> Result<HashSet<NodeId>> {
        let later = self
            .history
            .query_entries(
                &HistoryFilter::all()
                    .with_operations([ChangeOperation::Create, ChangeOperation::Delete])
                    .with_range(Some(at.saturating_add(1)), None),
            )
            .await?;

        let mut existing: HashSet<NodeId> = current.into_iter().collect();
        for entry in later.iter().filter(|e| e.operation == ChangeOperation::Delete) {
            existing.insert(entry.node_id);
        }
        for entry in later.iter().filter(|e| e.operation == ChangeOperation::Create) {
            existing.remove(&entry.node_id);
        }
        Ok(existing)
    }

    /// Stored entries in `[range_start, range_end]` plus missed tasks among
    /// `nodes`. Missed entries are computed here and never stored.
    pub async fn history_view<'a>(
        &self,
        range_start: u64,
        range_end: u64,
        now: u64,
        nodes: impl IntoIterator<Item = &'a Node>,
    ) -> Result<HistoryView> {
        let entries = self
            .history
            .query_entries(&HistoryFilter::all().with_range(Some(range_start), Some(range_end)))
            .await?;
        Ok(HistoryView {
            entries,
            missed: missed_entries(nodes, range_start, range_end, now),
        })
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        Ok(self.history.get_stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use planloom_types::TaskFacet;

    use crate::error::{OutlineError, PersistenceError};
    use crate::schedule::{Clock, ManualClock};
    use crate::store::{HistoryStore, MemoryHistoryStore, StoreResult};

    const DAY: u64 = 24 * 60 * 60 * 1000;

    fn setup(config: OutlineConfig) -> (Arc<ManualClock>, Arc<MemoryHistoryStore>, ChangeRecorder) {
        let clock = Arc::new(ManualClock::new(100 * DAY));
        let history = Arc::new(MemoryHistoryStore::new());
        let recorder = ChangeRecorder::new(history.clone(), clock.clone(), &config);
        (clock, history, recorder)
    }

    fn partial(values: impl IntoIterator<Item = FieldValue>) -> PartialNode {
        values.into_iter().map(|v| (v.field(), v)).collect()
    }

    fn entry_at(timestamp: u64, changes: Vec<FieldChange>) -> ChangeLogEntry {
        ChangeLogEntry {
            id: EntryId::new(),
            node_id: NodeId::new(),
            operation: ChangeOperation::Update,
            timestamp,
            before: PartialNode::new(),
            after: PartialNode::new(),
            changes,
            source: ChangeSource::User,
            metadata: EntryMetadata::default(),
        }
    }

    fn title_change() -> Vec<FieldChange> {
        vec![FieldChange {
            field: NodeField::Title,
            old: Some(FieldValue::Title("a".into())),
            new: Some(FieldValue::Title("b".into())),
        }]
    }

    fn content_change() -> Vec<FieldChange> {
        vec![FieldChange {
            field: NodeField::Content,
            old: Some(FieldValue::Content(vec![])),
            new: Some(FieldValue::Content(vec![ContentBlock::paragraph("text")])),
        }]
    }

    #[tokio::test]
    async fn test_undefined_to_empty_tags_records_nothing() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        let recorded = recorder
            .record(
                ChangeOperation::Update,
                NodeId::new(),
                partial([FieldValue::Tags(None)]),
                partial([FieldValue::Tags(Some(vec![]))]),
                ChangeSource::User,
            )
            .await
            .unwrap();
        assert!(recorded.is_none());
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_fields_alone_record_nothing() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        recorder
            .record(
                ChangeOperation::Update,
                NodeId::new(),
                partial([FieldValue::Position(1000.0), FieldValue::Level(1), FieldValue::UpdatedAt(1)]),
                partial([FieldValue::Position(1500.0), FieldValue::Level(2), FieldValue::UpdatedAt(2)]),
                ChangeSource::Tree,
            )
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_boundary_only_content_change_is_noise() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        let typed = vec![ContentBlock::paragraph("notes")];
        let marked = vec![
            ContentBlock::paragraph("notes"),
            ContentBlock::Boundary { at_ms: 5 },
            ContentBlock::paragraph(""),
        ];
        let id = NodeId::new();
        let noise = recorder
            .record(
                ChangeOperation::Update,
                id,
                partial([FieldValue::Content(typed.clone())]),
                partial([FieldValue::Content(marked.clone())]),
                ChangeSource::TimestampPolicy,
            )
            .await
            .unwrap();
        assert!(noise.is_none());

        let mut edited = marked;
        edited[2] = ContentBlock::paragraph("afternoon");
        let real = recorder
            .record(
                ChangeOperation::Update,
                id,
                partial([FieldValue::Content(typed)]),
                partial([FieldValue::Content(edited)]),
                ChangeSource::Autosave,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(real.changes.len(), 1);
        assert!(real.touches_content());
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_metadata_is_noise() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        let collapsed = BTreeMap::from([("collapsed".to_string(), serde_json::json!(true))]);
        recorder
            .record(
                ChangeOperation::Update,
                NodeId::new(),
                partial([FieldValue::Metadata(BTreeMap::new())]),
                partial([FieldValue::Metadata(collapsed)]),
                ChangeSource::User,
            )
            .await
            .unwrap();
        assert!(history.is_empty());

        let colour = BTreeMap::from([("colour".to_string(), serde_json::json!("red"))]);
        let kept = recorder
            .record(
                ChangeOperation::Update,
                NodeId::new(),
                partial([FieldValue::Metadata(BTreeMap::new())]),
                partial([FieldValue::Metadata(colour)]),
                ChangeSource::User,
            )
            .await
            .unwrap();
        assert!(kept.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_create_suppressed_inside_window() {
        let (clock, history, recorder) = setup(OutlineConfig::default());
        let node = Node::new("a", 1000.0);

        assert!(recorder.record_create(&node, ChangeSource::User).await.unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(recorder.record_create(&node, ChangeSource::Tree).await.unwrap().is_none());
        assert_eq!(history.len(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(recorder.record_create(&node, ChangeSource::User).await.unwrap().is_some());
        assert_eq!(history.len(), 2);
    }

    /// Fails the first `fail` entry writes, then delegates.
    struct FlakyHistory {
        inner: MemoryHistoryStore,
        fail: AtomicUsize,
    }

    #[async_trait]
    impl HistoryStore for FlakyHistory {
        async fn create_entry(&self, entry: &ChangeLogEntry) -> StoreResult<()> {
            if self
                .fail
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PersistenceError::backend("down"));
            }
            self.inner.create_entry(entry).await
        }

        async fn query_entries(&self, filter: &HistoryFilter) -> StoreResult<Vec<ChangeLogEntry>> {
            self.inner.query_entries(filter).await
        }

        async fn delete_entry(&self, id: EntryId) -> StoreResult<bool> {
            self.inner.delete_entry(id).await
        }

        async fn get_stats(&self) -> StoreResult<HistoryStats> {
            self.inner.get_stats().await
        }
    }

    #[tokio::test]
    async fn test_failed_create_write_does_not_suppress_retry() {
        let clock = Arc::new(ManualClock::new(100 * DAY));
        let history = Arc::new(FlakyHistory {
            inner: MemoryHistoryStore::new(),
            fail: AtomicUsize::new(1),
        });
        let recorder = ChangeRecorder::new(history.clone(), clock.clone(), &OutlineConfig::default());
        let node = Node::new("a", 1000.0);

        let err = recorder.record_create(&node, ChangeSource::User).await.unwrap_err();
        assert!(matches!(err, OutlineError::Persistence(PersistenceError::Backend(_))));

        clock.advance(Duration::from_millis(500));
        let retried = recorder.record_create(&node, ChangeSource::User).await.unwrap();
        assert!(retried.is_some());
        assert_eq!(history.inner.len(), 1);

        // The successful write claims the window again.
        assert!(recorder.record_create(&node, ChangeSource::Tree).await.unwrap().is_none());
        assert_eq!(history.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_boundary_discard_never_recorded() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        let recorded = recorder
            .record(
                ChangeOperation::Update,
                NodeId::new(),
                partial([FieldValue::Title("a".into())]),
                partial([FieldValue::Title("b".into())]),
                ChangeSource::BoundaryDiscard,
            )
            .await
            .unwrap();
        assert!(recorded.is_none());
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_delete_lists_removed_fields() {
        let (_, _, recorder) = setup(OutlineConfig::default());
        let node = Node::new("gone", 1000.0);
        let entry = recorder.record_delete(&node, ChangeSource::User).await.unwrap().unwrap();
        assert_eq!(entry.operation, ChangeOperation::Delete);
        assert!(entry.after.is_empty());
        assert!(entry.changes.iter().all(|c| c.new.is_none()));
        assert!(entry.changes.iter().any(|c| c.field == NodeField::Title));
        // Blank fields are not reported as removed.
        assert!(!entry.changes.iter().any(|c| c.field == NodeField::Tags));
    }

    #[tokio::test]
    async fn test_checkin_chains_snapshots() {
        let (clock, history, recorder) = setup(OutlineConfig::default());
        let mut node = Node::new("plan", 1000.0).with_content(vec![ContentBlock::paragraph("x")]);

        let first = recorder.checkin(&node, ChangeSource::User).await.unwrap().unwrap();
        assert_eq!(first.metadata.best_snapshot, None);

        node.content.push(ContentBlock::Boundary { at_ms: 9 });
        node.position = 4000.0;
        clock.advance(Duration::from_secs(60));
        assert!(recorder.checkin(&node, ChangeSource::User).await.unwrap().is_none());

        node.title = "plan v2".into();
        clock.advance(Duration::from_secs(60));
        let second = recorder.checkin(&node, ChangeSource::User).await.unwrap().unwrap();
        assert_eq!(second.metadata.best_snapshot, Some(first.id));
        assert_eq!(second.changes.iter().filter(|c| is_meaningful(c)).count(), 1);
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_by_class() {
        let config = OutlineConfig::default().with_retention(30, 3);
        let (clock, history, recorder) = setup(config);
        let now = clock.now_millis();
        let old = now - 40 * DAY;
        let recent = now - DAY;

        let meaningless = entry_at(recent, vec![]);
        let old_derived = entry_at(old, title_change());
        let old_title = entry_at(old, title_change());
        let old_content = entry_at(old, content_change());
        let recent_title = entry_at(recent, title_change());
        let recent_content = entry_at(recent, content_change());
        for entry in [&meaningless, &old_title, &old_content, &recent_title, &recent_content] {
            history.create_entry(entry).await.unwrap();
        }
        recorder.backfill(old_derived.clone()).await.unwrap();

        let report = recorder.cleanup(now).await.unwrap();

        assert_eq!(
            report,
            CleanupReport {
                meaningless_removed: 1,
                derived_removed: 1,
                evicted: 1,
                remaining: 3,
            }
        );
        let left: HashSet<EntryId> = history
            .query_entries(&HistoryFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(
            left,
            HashSet::from([old_content.id, recent_title.id, recent_content.id])
        );
    }

    #[tokio::test]
    async fn test_cleanup_under_cap_keeps_old_meaningful_entries() {
        let (clock, history, recorder) = setup(OutlineConfig::default());
        let now = clock.now_millis();
        history.create_entry(&entry_at(now - 90 * DAY, title_change())).await.unwrap();

        let report = recorder.cleanup(now).await.unwrap();
        assert_eq!(report.remaining, 1);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_nodes_at() {
        let (clock, _, recorder) = setup(OutlineConfig::default());
        let t = clock.now_millis() + 10_000;

        let survivor = Node::new("created before, deleted after", 1000.0);
        recorder.record_create(&survivor, ChangeSource::User).await.unwrap();
        clock.advance(Duration::from_millis(15_000));
        let late = Node::new("created after", 2000.0);
        recorder.record_create(&late, ChangeSource::User).await.unwrap();
        recorder.record_delete(&survivor, ChangeSource::User).await.unwrap();

        let existing = recorder.existing_nodes_at([late.id], t).await.unwrap();
        assert!(existing.contains(&survivor.id));
        assert!(!existing.contains(&late.id));
    }

    #[test]
    fn test_missed_entries() {
        let missed = Node::new("missed", 1000.0).with_task(TaskFacet::planned(150));
        let done_late = Node::new("done late", 2000.0).with_task(TaskFacet {
            planned_end_ms: Some(160),
            completed_at_ms: Some(400),
        });
        let done = Node::new("done", 3000.0).with_task(TaskFacet {
            planned_end_ms: Some(170),
            completed_at_ms: Some(180),
        });
        let future = Node::new("not due yet", 4000.0).with_task(TaskFacet::planned(250));
        let outside = Node::new("outside", 5000.0).with_task(TaskFacet::planned(50));
        let plain = Node::new("no task", 6000.0);
        let nodes = [missed.clone(), done_late.clone(), done, future, outside, plain];

        let result = missed_entries(&nodes, 100, 300, 200);

        let ids: Vec<NodeId> = result.iter().map(|m| m.node_id).collect();
        assert_eq!(ids, vec![missed.id, done_late.id]);
        assert_eq!(result[0].title, "missed");
    }

    #[tokio::test]
    async fn test_history_view_includes_missed_without_storing() {
        let (clock, history, recorder) = setup(OutlineConfig::default());
        let now = clock.now_millis();
        let task = Node::new("report", 1000.0).with_task(TaskFacet::planned(now - 1_000));
        recorder.record_create(&task, ChangeSource::User).await.unwrap();

        let view = recorder
            .history_view(now - 10_000, now + 10_000, now, [&task])
            .await
            .unwrap();
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.missed.len(), 1);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_record_commit_restricts_to_patched_fields() {
        let (_, history, recorder) = setup(OutlineConfig::default());
        let before = Node::new("old title", 1000.0).with_tags(vec!["keep".into()]);
        let mut after = before.clone();
        after.title = "new title".into();
        after.updated_at += 10;
        let plan = planloom_types::MutationPlan::from_patches(vec![
            FieldPatch::against(&before, FieldValue::Title(after.title.clone())),
            FieldPatch::against(&before, FieldValue::UpdatedAt(after.updated_at)),
        ]);
        let commit = Commit {
            plan,
            before: vec![before.clone()],
            after: vec![after],
            source: ChangeSource::User,
        };

        let entries = recorder.record_commit(&commit).await.unwrap();

        assert_eq!(entries.len(), 1);
        let keys: Vec<NodeField> = entries[0].after.keys().copied().collect();
        assert_eq!(keys, vec![NodeField::Title, NodeField::UpdatedAt]);
        assert!(!entries[0].before.contains_key(&NodeField::Tags));
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_pass_through() {
        let (_, _, recorder) = setup(OutlineConfig::default());
        recorder.record_create(&Node::new("a", 1.0), ChangeSource::User).await.unwrap();
        let stats = recorder.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_operation[&ChangeOperation::Create], 1);
    }
}
