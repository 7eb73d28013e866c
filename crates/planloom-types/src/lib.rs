//! Shared node and change-log types for Planloom.
//!
//! This crate is the leaf of the workspace: typed ids, the outline node
//! model, field patches and mutation plans, node commands, and change-log
//! entries. It has **no internal planloom dependencies**.
//!
//! # Key Types
//!
//! |---------------------|---------------------------------------------------|
//! | Type                | Purpose                                           |
//! |---------------------|---------------------------------------------------|
//! | [`Node`]            | One outline item (title, content, tree position)  |
//! | [`ContentBlock`]    | Paragraph or auto-generated boundary marker       |
//! | [`FieldValue`]      | Tagged value for one patchable field              |
//! | [`FieldPatch`]      | `{node, new, previous}` for one field             |
//! | [`MutationPlan`]    | All patches for one logical mutation              |
//! | [`NodeCommand`]     | Create / update / delete at the boundary          |
//! | [`ChangeLogEntry`]  | One audit record                                  |
//! |---------------------|---------------------------------------------------|

pub mod change;
pub mod field;
pub mod ids;
pub mod node;

pub use change::{ChangeLogEntry, ChangeOperation, ChangeSource, EntryMetadata, FieldChange, MissedEntry};
pub use field::{
    ALL_FIELDS, CommandError, CreateNodeCommand, DeleteNodeCommand, FieldPatch, FieldValue, MutationPlan,
    NodeCommand, NodeField, PartialNode, UpdateNodeCommand,
};
pub use ids::{EntryId, NodeId};
pub use node::{ContentBlock, Node, TaskFacet, boundary_equivalent, strip_boundaries};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
