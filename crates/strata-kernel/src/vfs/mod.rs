//! Log-structured virtual filesystem.
//!
//! One container file holds every file's bytes plus a JSON index describing
//! them. Key components:
//!
//! - [`BinaryStore`] - byte-level access to the container
//! - [`Index`] - file extents, directories, symlinks, metadata
//! - [`compactor`] - reclaims superseded ranges
//! - [`Vfs`] - the engine: every filesystem operation on top of the above
//! - [`NativeBackend`] - the same operations straight onto a host directory
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: every entry is keyed by its normalized path.
//! - **Overwrite in place when the size is unchanged**, append otherwise;
//!   waste is tracked and compacted away in the background.
//! - **Lazy index**: mutations dirty the in-memory index and a debounced
//!   flush persists it; durability points call [`Vfs::flush`].

pub mod compactor;
mod engine;
pub mod fd;
pub mod index;
pub mod maintenance;
mod native;
pub mod path;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use compactor::{CompactionPolicy, CompactionReport, Urgency};
pub use engine::{ExternalContent, MAX_SYMLINK_HOPS, Vfs, VfsStats};
pub use index::{Extent, Index, Metadata};
pub use native::NativeBackend;
pub use store::BinaryStore;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
