//! # strata-kernel
//!
//! A log-structured virtual filesystem reachable through a blocking call
//! from any execution context.
//!
//! - [`vfs`] keeps every file in one container file plus a JSON index
//! - [`sync`] mirrors the store into a host directory and imports foreign
//!   changes back
//! - [`protocol`] gives callers a blocking request/response over a shared
//!   arena served by an executor thread
//! - [`coord`] elects the one context that owns storage and relays the
//!   others' calls to it
//!
//! Most users start from [`Origin`]: spawn contexts, wait for one to be
//! ready, and issue [`Op`](strata_types::Op)s through its client.

pub mod backend;
pub mod config;
pub mod coord;
pub mod protocol;
pub mod sync;
pub mod vfs;

pub use backend::{Backend, Storage};
pub use config::{ConfigError, StorageMode, StrataConfig};
pub use coord::{ContextHandle, ContextRecord, Origin, Role};
pub use protocol::{Arena, Executor, ExecutorHandle, SyncClient};
pub use vfs::{NativeBackend, Vfs, VfsStats};
