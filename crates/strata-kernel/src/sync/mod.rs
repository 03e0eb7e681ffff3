//! Keeping the store and native storage in step.
//!
//! - [`EventQueue`] - tells our own native changes apart from foreign ones
//! - [`SyncQueue`] - write-behind mirroring of store mutations (hybrid mode)
//! - [`NativeWatcher`] - imports foreign native changes into the store

pub mod events;
pub mod mirror;
pub mod watcher;
pub mod write_behind;

pub use events::{EventKind, EventMetrics, EventOrigin, EventQueue, KindCounts, MetricsSnapshot};
pub use mirror::{Applied, MirrorOp, NativeMirror};
pub use watcher::{ExternalChange, NativeChange, NativeWatcher, Reconciler};
pub use write_behind::{ContentSource, MirrorTarget, SyncMetricsSnapshot, SyncOp, SyncQueue};
