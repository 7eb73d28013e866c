//! End-to-end outline scenarios over the in-memory stores and a manual clock.

use std::sync::Arc;
use std::time::Duration;

use planloom_kernel::{
    Clock, ManualClock, MemoryHistoryStore, MemoryNodeStore, NodeEvent, Outline, OutlineConfig, OutlineError,
};
use planloom_types::{
    ChangeOperation, ChangeSource, ContentBlock, CreateNodeCommand, FieldValue, Node, NodeField, NodeId, TaskFacet,
    UpdateNodeCommand,
};

const START_MS: u64 = 1_700_000_000_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    clock: Arc<ManualClock>,
    nodes: Arc<MemoryNodeStore>,
    history: Arc<MemoryHistoryStore>,
    outline: Arc<Outline>,
}

async fn harness_with(config: OutlineConfig) -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::new(START_MS));
    let nodes = Arc::new(MemoryNodeStore::new());
    let history = Arc::new(MemoryHistoryStore::new());
    let outline = Outline::new(config, nodes.clone(), history.clone(), clock.clone(), clock.clone())
        .expect("valid config");
    outline.init().await.expect("init");
    Harness {
        clock,
        nodes,
        history,
        outline: Arc::new(outline),
    }
}

async fn harness() -> Harness {
    harness_with(OutlineConfig::default()).await
}

fn paragraphs(texts: &[&str]) -> Vec<ContentBlock> {
    texts.iter().map(|t| ContentBlock::paragraph(*t)).collect()
}

fn titles(outline: &Outline, parent: Option<NodeId>) -> Vec<String> {
    outline.children(parent).into_iter().map(|n| n.title).collect()
}

#[tokio::test]
async fn test_indent_moves_node_under_previous_sibling() {
    let h = harness().await;
    let a = h.outline.insert_node("A", None, None).await.unwrap();
    let b = h.outline.insert_node("B", Some(a.id), None).await.unwrap();
    let c = h.outline.insert_node("C", Some(a.id), Some(b.id)).await.unwrap();

    let commit = h.outline.indent(c.id).await.unwrap();

    let moved = h.outline.get(&c.id).unwrap();
    assert_eq!(moved.parent_id, Some(b.id));
    assert_eq!(moved.level, 2);
    assert_eq!(commit.node_ids(), vec![c.id]);
    assert_eq!(titles(&h.outline, Some(a.id)), vec!["B"]);
    assert_eq!(titles(&h.outline, Some(b.id)), vec!["C"]);
    assert_eq!(h.nodes.stored(&c.id).unwrap().parent_id, Some(b.id));

    let history = h.outline.node_history(c.id).await.unwrap();
    let update = history.iter().find(|e| e.operation == ChangeOperation::Update).unwrap();
    assert_eq!(update.source, ChangeSource::Tree);
    assert!(update.changes.iter().any(|c| c.field == NodeField::ParentId));
}

#[tokio::test]
async fn test_outdent_carries_subtree_levels() {
    let h = harness().await;
    let a = h.outline.insert_node("A", None, None).await.unwrap();
    let b = h.outline.insert_node("B", Some(a.id), None).await.unwrap();
    let d = h.outline.insert_node("D", Some(b.id), None).await.unwrap();
    let c = h.outline.insert_node("C", Some(a.id), Some(b.id)).await.unwrap();

    h.outline.outdent(b.id).await.unwrap();

    assert_eq!(titles(&h.outline, None), vec!["A", "B"]);
    assert_eq!(h.outline.get(&b.id).unwrap().level, 0);
    assert_eq!(h.outline.get(&d.id).unwrap().level, 1);
    assert_eq!(h.outline.get(&c.id).unwrap().parent_id, Some(a.id));
    assert_eq!(h.nodes.stored(&d.id).unwrap().level, 1);
}

#[tokio::test]
async fn test_inserts_bisect_sibling_gaps() {
    let h = harness().await;
    let first = h.outline.insert_node("first", None, None).await.unwrap();
    let last = h.outline.insert_node("last", None, Some(first.id)).await.unwrap();
    let mid = h.outline.insert_node("mid", None, Some(first.id)).await.unwrap();
    let early = h.outline.insert_node("early", None, Some(first.id)).await.unwrap();

    assert_eq!(first.position, 1000.0);
    assert_eq!(last.position, 2000.0);
    assert_eq!(mid.position, 1500.0);
    assert_eq!(early.position, 1250.0);
    assert_eq!(titles(&h.outline, None), vec!["first", "early", "mid", "last"]);
}

#[tokio::test]
async fn test_exhausted_gap_renumbers_and_retries_once() {
    let h = harness().await;
    let low = Node::new("low", 1000.0);
    let high = Node::new("high", f64::from_bits(1000.0_f64.to_bits() + 1));
    h.outline.create_node(CreateNodeCommand { node: low.clone() }).await.unwrap();
    h.outline.create_node(CreateNodeCommand { node: high.clone() }).await.unwrap();

    let wedged = h.outline.insert_node("wedged", None, Some(low.id)).await.unwrap();

    assert_eq!(titles(&h.outline, None), vec!["low", "wedged", "high"]);
    let positions: Vec<f64> = h.outline.children(None).iter().map(|n| n.position).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "positions not increasing: {positions:?}");
    assert_eq!(h.nodes.stored(&high.id).unwrap().position, 2000.0);
    assert_eq!(h.nodes.stored(&wedged.id).unwrap().position, 1500.0);
}

#[tokio::test]
async fn test_cycle_rejected_without_writes() {
    let h = harness().await;
    let a = h.outline.insert_node("A", None, None).await.unwrap();
    let b = h.outline.insert_node("B", Some(a.id), None).await.unwrap();
    let d = h.outline.insert_node("D", Some(b.id), None).await.unwrap();
    let writes = h.nodes.write_count();

    let err = h.outline.reparent(a.id, Some(d.id), None).await.unwrap_err();

    assert!(matches!(err, OutlineError::Cycle { node, target } if node == a.id && target == d.id));
    assert_eq!(h.nodes.write_count(), writes);
    assert_eq!(h.outline.get(&a.id).unwrap().parent_id, None);
}

#[tokio::test]
async fn test_failed_persist_rolls_back_and_records_nothing() {
    let h = harness().await;
    let a = h.outline.insert_node("A", None, None).await.unwrap();
    let b = h.outline.insert_node("B", None, Some(a.id)).await.unwrap();
    let mut events = h.outline.subscribe();
    let before = h.outline.get(&b.id).unwrap();

    h.nodes.fail_next_writes(1);
    let err = h.outline.indent(b.id).await.unwrap_err();

    assert!(matches!(err, OutlineError::Rollback { ref nodes, .. } if nodes == &vec![b.id]));
    assert_eq!(h.outline.get(&b.id).unwrap(), before);
    assert_eq!(titles(&h.outline, None), vec!["A", "B"]);
    assert!(matches!(events.recv().await.unwrap(), NodeEvent::RolledBack { .. }));
    let history = h.outline.node_history(b.id).await.unwrap();
    assert!(history.iter().all(|e| e.operation == ChangeOperation::Create));
}

#[tokio::test]
async fn test_update_fields_records_meaningful_change() {
    let h = harness().await;
    let node = h.outline.insert_node("draft", None, None).await.unwrap();
    h.clock.advance(Duration::from_secs(1));

    h.outline
        .update_fields(UpdateNodeCommand::new(node.id, vec![FieldValue::Title("final".into())]))
        .await
        .unwrap();

    let stored = h.nodes.stored(&node.id).unwrap();
    assert_eq!(stored.title, "final");
    assert_eq!(stored.updated_at, START_MS + 1000);
    let history = h.outline.node_history(node.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let title = history[1].changes.iter().find(|c| c.field == NodeField::Title).unwrap();
    assert_eq!(title.new, Some(FieldValue::Title("final".into())));
}

#[tokio::test]
async fn test_delete_only_leaves() {
    let h = harness().await;
    let parent = h.outline.insert_node("parent", None, None).await.unwrap();
    let child = h.outline.insert_node("child", Some(parent.id), None).await.unwrap();

    let err = h.outline.delete_node(parent.id).await.unwrap_err();
    assert!(matches!(err, OutlineError::HasChildren(id) if id == parent.id));

    h.outline.delete_node(child.id).await.unwrap();
    assert!(h.outline.get(&child.id).is_none());
    assert!(h.nodes.stored(&child.id).is_none());
    let history = h.outline.node_history(child.id).await.unwrap();
    assert_eq!(history.last().unwrap().operation, ChangeOperation::Delete);

    h.outline.delete_node(parent.id).await.unwrap();
}

#[tokio::test]
async fn test_unused_marker_is_discarded_on_blur() {
    let h = harness().await;
    let original = paragraphs(&["morning"]);
    let node = Node::new("journal", 1000.0).with_content(original.clone());
    h.outline.create_node(CreateNodeCommand { node: node.clone() }).await.unwrap();

    let marker = h.outline.focus(node.id).await.unwrap();
    assert!(marker.is_some());
    let marked = h.outline.get(&node.id).unwrap().content;
    assert_eq!(marked.len(), 3);
    assert!(marked[1].is_boundary());

    let discard = h.outline.blur(node.id).await.unwrap();
    assert!(discard.is_some());
    assert_eq!(h.outline.get(&node.id).unwrap().content, original);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, original);

    // Neither the marker nor its removal shows up in the log.
    let history = h.outline.node_history(node.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, ChangeOperation::Create);
}

#[tokio::test]
async fn test_failed_discard_keeps_marker_pending_for_retry() {
    let h = harness().await;
    let original = paragraphs(&["morning"]);
    let node = Node::new("journal", 1000.0).with_content(original.clone());
    h.outline.create_node(CreateNodeCommand { node: node.clone() }).await.unwrap();
    h.outline.focus(node.id).await.unwrap();

    h.nodes.fail_next_writes(1);
    let err = h.outline.blur(node.id).await.unwrap_err();
    assert!(matches!(err, OutlineError::Rollback { .. }));
    assert_eq!(h.outline.get(&node.id).unwrap().content.len(), 3);
    assert_eq!(h.outline.policy().pending_groups(), vec![node.id]);

    let retry = h.outline.blur(node.id).await.unwrap();
    assert!(retry.is_some());
    assert_eq!(h.outline.get(&node.id).unwrap().content, original);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, original);
    assert!(h.outline.policy().pending_groups().is_empty());
}

#[tokio::test]
async fn test_typing_after_marker_keeps_it() {
    let h = harness().await;
    let node = Node::new("journal", 1000.0).with_content(paragraphs(&["morning"]));
    h.outline.create_node(CreateNodeCommand { node: node.clone() }).await.unwrap();

    h.outline.focus(node.id).await.unwrap();
    let mut typed = h.outline.get(&node.id).unwrap().content;
    *typed.last_mut().unwrap() = ContentBlock::paragraph("evening");
    h.outline.edit_content(node.id, typed.clone()).unwrap();

    h.clock.advance(h.outline.config().autosave_debounce());
    assert_eq!(h.outline.flush_due().await.unwrap(), 1);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, typed);

    assert!(h.outline.blur(node.id).await.unwrap().is_none());
    assert_eq!(h.outline.get(&node.id).unwrap().content, typed);

    let history = h.outline.node_history(node.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.source, ChangeSource::Autosave);
    assert!(last.touches_content());

    // Resuming a minute later is inside the idle threshold.
    h.clock.advance(Duration::from_secs(60));
    assert!(h.outline.focus(node.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_keystrokes_inside_debounce_flush_once() {
    let h = harness().await;
    let node = h.outline.insert_node("notes", None, None).await.unwrap();
    let writes = h.nodes.write_count();

    for text in ["h", "he", "hel", "hell", "hello"] {
        h.outline.edit_content(node.id, paragraphs(&[text])).unwrap();
        h.clock.advance(Duration::from_millis(200));
    }
    assert_eq!(h.outline.flush_due().await.unwrap(), 0);

    h.clock.advance(h.outline.config().autosave_debounce());
    assert_eq!(h.outline.flush_due().await.unwrap(), 1);
    assert_eq!(h.nodes.write_count(), writes + 1);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, paragraphs(&["hello"]));
}

#[tokio::test]
async fn test_failed_autosave_stays_buffered() {
    let h = harness().await;
    let node = h.outline.insert_node("notes", None, None).await.unwrap();
    h.outline.edit_content(node.id, paragraphs(&["kept"])).unwrap();
    h.clock.advance(h.outline.config().autosave_debounce());

    h.nodes.fail_next_writes(1);
    assert!(h.outline.flush_due().await.is_err());
    assert!(h.outline.get(&node.id).unwrap().content.is_empty());

    h.clock.advance(h.outline.config().autosave_debounce());
    assert_eq!(h.outline.flush_due().await.unwrap(), 1);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, paragraphs(&["kept"]));
}

#[tokio::test]
async fn test_autosave_worker_flushes_in_background() {
    let h = harness().await;
    let node = h.outline.insert_node("notes", None, None).await.unwrap();
    let worker = h.outline.spawn_autosave_worker();
    let mut events = h.outline.subscribe();

    h.outline.edit_content(node.id, paragraphs(&["background"])).unwrap();
    h.clock.advance(h.outline.config().autosave_debounce());

    let committed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(NodeEvent::Committed { node_ids, source }) = events.recv().await
                && source == ChangeSource::Autosave
            {
                return node_ids;
            }
        }
    })
    .await
    .expect("autosave commit");
    assert_eq!(committed, vec![node.id]);
    assert_eq!(h.nodes.stored(&node.id).unwrap().content, paragraphs(&["background"]));

    h.outline.dispose();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker stops")
        .unwrap();
}

#[tokio::test]
async fn test_end_session_flushes_and_discards() {
    let h = harness().await;
    let idle = h.outline.insert_node("idle", None, None).await.unwrap();
    let busy = h.outline.insert_node("busy", None, Some(idle.id)).await.unwrap();

    h.outline.focus(idle.id).await.unwrap();
    h.outline.focus(busy.id).await.unwrap();
    h.outline
        .edit_content(busy.id, vec![
            ContentBlock::Boundary { at_ms: START_MS },
            ContentBlock::paragraph("written"),
        ])
        .unwrap();

    let discarded = h.outline.end_session().await.unwrap();

    assert_eq!(discarded, vec![idle.id]);
    assert!(h.nodes.stored(&idle.id).unwrap().content.is_empty());
    assert_eq!(
        planloom_types::strip_boundaries(&h.nodes.stored(&busy.id).unwrap().content),
        "written"
    );
    assert!(h.outline.policy().pending_groups().is_empty());
}

#[tokio::test]
async fn test_existing_nodes_at_replays_log() {
    let h = harness().await;
    let kept = h.outline.insert_node("kept", None, None).await.unwrap();
    let gone = h.outline.insert_node("gone", None, Some(kept.id)).await.unwrap();
    let checkpoint = h.clock.now_millis();

    h.clock.advance(Duration::from_secs(15));
    h.outline.delete_node(gone.id).await.unwrap();
    let later = h.outline.insert_node("later", None, Some(kept.id)).await.unwrap();

    let then = h.outline.existing_nodes_at(checkpoint).await.unwrap();
    assert!(then.contains(&kept.id));
    assert!(then.contains(&gone.id));
    assert!(!then.contains(&later.id));

    let now = h.outline.existing_nodes_at(h.clock.now_millis()).await.unwrap();
    assert!(now.contains(&later.id));
    assert!(!now.contains(&gone.id));
}

#[tokio::test]
async fn test_history_view_reports_missed_tasks() {
    let h = harness().await;
    let overdue = Node::new("file taxes", 1000.0).with_task(TaskFacet::planned(START_MS + 60_000));
    let mut done_task = TaskFacet::planned(START_MS + 60_000);
    done_task.completed_at_ms = Some(START_MS + 30_000);
    let done = Node::new("pay rent", 2000.0).with_task(done_task);
    let later = Node::new("book flights", 3000.0).with_task(TaskFacet::planned(START_MS + 3_600_000));
    for node in [overdue.clone(), done, later] {
        h.outline.create_node(CreateNodeCommand { node }).await.unwrap();
    }
    h.clock.advance(Duration::from_secs(120));
    let writes = h.history.len();

    let view = h
        .outline
        .history_view(START_MS, START_MS + 24 * 3_600_000)
        .await
        .unwrap();

    assert_eq!(view.missed.len(), 1);
    assert_eq!(view.missed[0].node_id, overdue.id);
    assert_eq!(view.missed[0].title, "file taxes");
    assert_eq!(view.entries.len(), 3);
    assert_eq!(h.history.len(), writes);
}

#[tokio::test]
async fn test_cleanup_enforces_cap_oldest_first() {
    let h = harness_with(OutlineConfig::default().with_retention(30, 3)).await;
    let mut ids = Vec::new();
    let mut after = None;
    for title in ["one", "two", "three", "four", "five"] {
        let node = h.outline.insert_node(title, None, after).await.unwrap();
        after = Some(node.id);
        ids.push(node.id);
        h.clock.advance(Duration::from_secs(1));
    }

    let report = h.outline.cleanup_history().await.unwrap();

    assert_eq!(report.evicted, 2);
    assert_eq!(report.remaining, 3);
    assert_eq!(h.outline.history_stats().await.unwrap().total, 3);
    assert!(h.outline.node_history(ids[0]).await.unwrap().is_empty());
    assert_eq!(h.outline.node_history(ids[4]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_checkin_links_previous_snapshot() {
    let h = harness().await;
    let node = h.outline.insert_node("weekly review", None, None).await.unwrap();

    let first = h.outline.checkin(node.id).await.unwrap().unwrap();
    assert!(h.outline.checkin(node.id).await.unwrap().is_none());

    h.outline
        .update_fields(UpdateNodeCommand::new(node.id, vec![FieldValue::Title("monthly review".into())]))
        .await
        .unwrap();
    let second = h.outline.checkin(node.id).await.unwrap().unwrap();
    assert_eq!(second.metadata.best_snapshot, Some(first.id));
}

#[tokio::test]
async fn test_cold_start_loads_existing_tree() {
    init_tracing();
    let root = Node::new("root", 1000.0);
    let child = Node::new("child", 1000.0).with_parent(root.id, 1);
    let clock = Arc::new(ManualClock::new(START_MS));
    let nodes = Arc::new(MemoryNodeStore::with_nodes([root.clone(), child.clone()]));
    let outline = Outline::new(
        OutlineConfig::default(),
        nodes.clone(),
        Arc::new(MemoryHistoryStore::new()),
        clock.clone(),
        clock,
    )
    .unwrap();

    assert_eq!(outline.init().await.unwrap(), 2);
    let order: Vec<(u32, String)> = outline.display_order().into_iter().map(|(d, n)| (d, n.title)).collect();
    assert_eq!(order, vec![(0, "root".to_string()), (1, "child".to_string())]);
}

#[tokio::test]
async fn test_config_from_toml_drives_debounce() {
    let config = OutlineConfig::from_toml_str("autosave_debounce_ms = 100\n").unwrap();
    let h = harness_with(config).await;
    let node = h.outline.insert_node("quick", None, None).await.unwrap();

    h.outline.edit_content(node.id, paragraphs(&["fast"])).unwrap();
    h.clock.advance(Duration::from_millis(100));

    assert_eq!(h.outline.flush_due().await.unwrap(), 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = OutlineConfig::default().with_position_gap(0.0);
    let clock = Arc::new(ManualClock::new(START_MS));
    let result = Outline::new(
        config,
        Arc::new(MemoryNodeStore::new()),
        Arc::new(MemoryHistoryStore::new()),
        clock.clone(),
        clock,
    );
    assert!(matches!(result, Err(OutlineError::Config(_))));
}

#[tokio::test]
async fn test_disposed_outline_rejects_work() {
    let h = harness().await;
    let node = h.outline.insert_node("last words", None, None).await.unwrap();
    h.outline.edit_content(node.id, paragraphs(&["unsaved"])).unwrap();

    h.outline.dispose();

    assert!(matches!(
        h.outline.insert_node("late", None, None).await,
        Err(OutlineError::Disposed)
    ));
    assert!(matches!(
        h.outline.edit_content(node.id, vec![]),
        Err(OutlineError::Disposed)
    ));
    assert!(matches!(h.outline.indent(node.id).await, Err(OutlineError::Disposed)));
    assert!(matches!(h.outline.node_history(node.id).await, Err(OutlineError::Disposed)));
    assert!(matches!(h.outline.checkin(node.id).await, Err(OutlineError::Disposed)));
    assert!(matches!(h.outline.cleanup_history().await, Err(OutlineError::Disposed)));
    assert!(matches!(h.outline.history_stats().await, Err(OutlineError::Disposed)));
    // Buffered edits are dropped on dispose.
    h.clock.advance(Duration::from_secs(5));
    assert_eq!(h.outline.flush_due().await.unwrap(), 0);
    assert!(h.nodes.stored(&node.id).unwrap().content.is_empty());
}
