//! Outline node model.
//!
//! A [`Node`] is one outline item: a title, a stream of content blocks, and
//! its place in the hierarchy (`parent_id` + sibling `position`). The cached
//! `level` is for display only; decisions recompute depth from the parent
//! chain.
//!
//! ## Content stream
//!
//! Content is a flat list of [`ContentBlock`]s. Most are paragraphs typed by
//! the user; `Boundary` blocks are auto-generated time markers inserted when
//! editing resumes after a gap. Markers are not content: two streams that
//! differ only by markers (and the empty placeholder paragraph a marker
//! leaves behind) are considered the same text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// One block in a node's content stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// User-authored text.
    Paragraph { text: String },
    /// Auto-generated marker recording when editing resumed (Unix millis).
    Boundary { at_ms: u64 },
}

impl ContentBlock {
    /// Create a paragraph block.
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::Paragraph { text: text.into() }
    }

    /// Check if this is an auto-generated boundary marker.
    pub fn is_boundary(&self) -> bool {
        matches!(self, Self::Boundary { .. })
    }

    /// Check if this is a paragraph with no text (a placeholder).
    pub fn is_empty_paragraph(&self) -> bool {
        matches!(self, Self::Paragraph { text } if text.is_empty())
    }
}

/// Render content with boundary markers removed.
///
/// Paragraphs are joined with `\n`; trailing empty paragraphs are dropped so
/// the placeholder a marker introduces does not count as text.
pub fn strip_boundaries(blocks: &[ContentBlock]) -> String {
    let mut paragraphs: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Paragraph { text } => Some(text.as_str()),
            ContentBlock::Boundary { .. } => None,
        })
        .collect();
    while paragraphs.last().is_some_and(|t| t.is_empty()) {
        paragraphs.pop();
    }
    paragraphs.join("\n")
}

/// Check whether two content streams are the same text once markers are stripped.
pub fn boundary_equivalent(a: &[ContentBlock], b: &[ContentBlock]) -> bool {
    strip_boundaries(a) == strip_boundaries(b)
}

/// Task-like facet of a node (planned end + completion).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFacet {
    /// Planned end time (Unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_end_ms: Option<u64>,
    /// When the task was completed (Unix millis), if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl TaskFacet {
    /// A task planned to end at `planned_end_ms`, not yet complete.
    pub fn planned(planned_end_ms: u64) -> Self {
        Self {
            planned_end_ms: Some(planned_end_ms),
            completed_at_ms: None,
        }
    }

    /// Check if the task was still incomplete at `at_ms`.
    pub fn incomplete_at(&self, at_ms: u64) -> bool {
        match self.completed_at_ms {
            Some(done) => done > at_ms,
            None => true,
        }
    }
}

/// One outline item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Ownership edge only. `None` for roots.
    pub parent_id: Option<NodeId>,
    /// Sort key among siblings. Unique per parent.
    pub position: f64,
    /// Cached depth for display. Never authoritative.
    pub level: u32,
    pub title: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskFacet>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// Create a root node with a fresh id at `position`.
    pub fn new(title: impl Into<String>, position: f64) -> Self {
        let now = crate::now_millis();
        Self {
            id: NodeId::new(),
            parent_id: None,
            position,
            level: 0,
            title: title.into(),
            content: Vec::new(),
            tags: None,
            task: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Place this node under `parent` at `level`.
    pub fn with_parent(mut self, parent: NodeId, level: u32) -> Self {
        self.parent_id = Some(parent);
        self.level = level;
        self
    }

    /// Set the content stream.
    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    /// Attach a task facet.
    pub fn with_task(mut self, task: TaskFacet) -> Self {
        self.task = Some(task);
        self
    }

    /// Set tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Check if this is a root node (no parent).
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
