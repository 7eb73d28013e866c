//! Debounced content autosave.
//!
//! Keystrokes would otherwise turn into one store write each. The buffer keeps
//! the latest content per node and restarts that node's timer on every edit;
//! when a timer fires the node id is sent on the due channel, and the outline
//! flushes it through the coordinator.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use planloom_types::{ContentBlock, NodeId};

use crate::schedule::{SharedScheduler, TimerHandle};

#[derive(Debug)]
struct PendingSave {
    content: Vec<ContentBlock>,
    timer: TimerHandle,
}

/// Per-node debounce of content edits.
pub struct AutosaveBuffer {
    scheduler: SharedScheduler,
    debounce: Duration,
    pending: Mutex<HashMap<NodeId, PendingSave>>,
    due_tx: mpsc::UnboundedSender<NodeId>,
}

impl AutosaveBuffer {
    /// Create a buffer and the receiver on which due node ids arrive.
    pub fn new(scheduler: SharedScheduler, debounce: Duration) -> (Self, mpsc::UnboundedReceiver<NodeId>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let buffer = Self {
            scheduler,
            debounce,
            pending: Mutex::new(HashMap::new()),
            due_tx,
        };
        (buffer, due_rx)
    }

    /// Buffer the latest content for `node_id` and restart its timer.
    pub fn stage(&self, node_id: NodeId, content: Vec<ContentBlock>) {
        let due_tx = self.due_tx.clone();
        let timer = self.scheduler.after(
            self.debounce,
            Box::new(move || {
                // Receiver gone means the outline was dropped.
                let _ = due_tx.send(node_id);
            }),
        );
        let previous = self
            .pending
            .lock()
            .insert(node_id, PendingSave { content, timer });
        if let Some(previous) = previous {
            previous.timer.cancel();
        }
    }

    /// Remove and return the buffered content for `node_id`.
    pub fn take(&self, node_id: NodeId) -> Option<Vec<ContentBlock>> {
        let save = self.pending.lock().remove(&node_id)?;
        save.timer.cancel();
        Some(save.content)
    }

    /// Buffered content for `node_id`, left in place.
    pub fn peek(&self, node_id: NodeId) -> Option<Vec<ContentBlock>> {
        self.pending.lock().get(&node_id).map(|s| s.content.clone())
    }

    /// Drop buffered content for `node_id` without saving it.
    pub fn cancel(&self, node_id: NodeId) {
        self.take(node_id);
    }

    pub fn pending_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.pending.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_pending(&self, node_id: NodeId) -> bool {
        self.pending.lock().contains_key(&node_id)
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        for (_, save) in self.pending.lock().drain() {
            save.timer.cancel();
        }
    }
}
