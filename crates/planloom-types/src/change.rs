//! Change-log entry types.
//!
//! One [`ChangeLogEntry`] is written per committed node mutation. `before`
//! and `after` are partial images restricted to the fields the mutation
//! meant to touch; `changes` lists the field-level differences between them.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::field::{FieldValue, NodeField, PartialNode};
use crate::ids::{EntryId, NodeId};

/// What kind of mutation an entry records.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
    /// Full snapshot taken on demand, used as a reconstruction base.
    Checkin,
}

/// Which path produced a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeSource {
    /// Direct user edit (title, tags, task fields).
    #[default]
    User,
    /// Reparent / indent / outdent / renumber.
    Tree,
    /// Debounced content flush.
    Autosave,
    /// Boundary marker insertion.
    TimestampPolicy,
    /// Removal of an unconfirmed boundary marker. Never recorded.
    BoundaryDiscard,
    /// Reconstructed after the fact (imports, repairs).
    Backfill,
}

impl ChangeSource {
    /// Check if mutations from this source belong in the change log at all.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, Self::BoundaryDiscard)
    }
}

/// One field difference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: NodeField,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

/// Optional annotations on an entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry was derived or backfilled rather than observed live.
    #[serde(default)]
    pub derived: bool,
    /// Previous checkin for this node, when this entry is a checkin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_snapshot: Option<EntryId>,
}

/// An append-only audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: EntryId,
    pub node_id: NodeId,
    pub operation: ChangeOperation,
    /// Unix millis.
    pub timestamp: u64,
    pub before: PartialNode,
    pub after: PartialNode,
    pub changes: Vec<FieldChange>,
    pub source: ChangeSource,
    #[serde(default)]
    pub metadata: EntryMetadata,
}

impl ChangeLogEntry {
    /// Check if any recorded change touches the content stream.
    pub fn touches_content(&self) -> bool {
        self.changes.iter().any(|c| c.field == NodeField::Content)
    }
}

/// A task that passed its planned end without being completed.
///
/// Computed per query and never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedEntry {
    pub node_id: NodeId,
    pub title: String,
    pub planned_end_ms: u64,
}
