//! # planloom-kernel
//!
//! Runtime for a planloom outline.
//!
//! The kernel keeps the node tree in memory, persists it optimistically and
//! keeps an audit log of what changed:
//! - [`Coordinator`] owns the cache and serializes writes per node. Failed
//!   writes roll back every node the plan touched.
//! - [`ChangeRecorder`] turns commits into change-log entries, filters out
//!   the ones nobody cares about and enforces retention.
//! - [`TimestampPolicy`] inserts boundary markers when editing resumes after
//!   an idle gap, and drops them when nothing was written.
//! - [`AutosaveBuffer`] debounces content edits.
//! - [`Outline`] ties them together for editing surfaces.
//!
//! Storage sits behind [`NodeStore`] and [`HistoryStore`]; the in-memory
//! backends in [`store::memory`] are used by tests and ephemeral outlines.

pub mod autosave;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod outline;
pub mod recorder;
pub mod schedule;
pub mod store;
pub mod timestamp;

pub use autosave::AutosaveBuffer;
pub use config::{ConfigError, OutlineConfig};
pub use coordinator::{Commit, Coordinator, SharedCoordinator};
pub use error::{OutlineError, PersistenceError, Result};
pub use events::NodeEvent;
pub use outline::Outline;
pub use recorder::{ChangeRecorder, CleanupReport, HistoryView};
pub use schedule::{Clock, ManualClock, Scheduler, SharedClock, SharedScheduler, SystemClock, TimerHandle, TokioScheduler};
pub use store::{
    HistoryFilter, HistoryStats, HistoryStore, MemoryHistoryStore, MemoryNodeStore, NodeFilter, NodeStore,
    SharedHistoryStore, SharedNodeStore,
};
pub use timestamp::{GroupPhase, TimestampPolicy};
