//! Synchronous request protocol.
//!
//! A caller blocks on an [`Arena`] while an [`Executor`] thread runs the
//! operation and writes the answer back. Key components:
//!
//! - [`Arena`] - status word, frame payload, lock word, metrics, dump slot
//! - [`codec`] - request and response frame layouts
//! - [`SyncClient`] - the blocking caller
//! - [`Executor`] - the serving loop
//! - [`WaitStrategy`] - blocking wait or the busy-spin shim
//! - [`BoundedQueue`] - drop-oldest hand-off used for background posts

pub mod arena;
pub mod client;
pub mod codec;
pub mod executor;
pub mod queue;
pub mod wait;

pub use arena::{Arena, DumpSlot, Signal, Status};
pub use client::SyncClient;
pub use executor::{Executor, ExecutorHandle};
pub use queue::BoundedQueue;
pub use wait::{BlockingWait, SpinWait, WaitStrategy};
