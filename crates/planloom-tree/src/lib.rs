//! Pure outline tree logic for Planloom.
//!
//! Nodes form a forest through `parent_id`; siblings are ordered by a
//! fractional `position`. This crate owns everything that can be decided
//! without I/O:
//!
//! - [`PositionAllocator`]: positions between siblings, renumbering
//! - [`OutlineIndex`]: nodes plus per-parent sorted child lists, maintained
//!   incrementally, with bounded parent-chain walks
//! - [`TreeMutator`]: reparent / indent / outdent / renumber as
//!   [`MutationPlan`](planloom_types::MutationPlan)s
//!
//! # Levels
//!
//! A node's `level` field is a display cache. Every decision here derives
//! depth from the parent chain instead, and plans rewrite the cached level
//! of each node whose derived depth moves.

mod error;
mod index;
mod mutator;
mod position;

pub use error::TreeError;
pub use index::{MAX_DEPTH, OutlineIndex};
pub use mutator::TreeMutator;
pub use position::{DEFAULT_GAP, PositionAllocator};

/// Result type for tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;
