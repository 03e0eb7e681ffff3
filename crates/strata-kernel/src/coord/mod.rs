//! Context coordination.
//!
//! Several execution contexts share one origin; exactly one of them owns
//! the storage. Key components:
//!
//! - [`LockManager`] - origin-scoped advisory locks (leader and lifetime locks)
//! - [`SharedChannel`] - announcements every context listens to
//! - [`Broker`] - hands request/response ports from secondaries to the primary
//! - [`Relay`] - the executor backend that routes locally or to the primary
//! - [`Origin`] / [`ContextHandle`] - the per-context state machine

pub mod broker;
pub mod channel;
pub mod context;
pub mod locks;
pub mod relay;

pub use broker::{Broker, FsRequest, FsResponse, Incoming, PortHandoff};
pub use channel::{Announcement, SharedChannel};
pub use context::{ContextHandle, ContextRecord, Origin, Role, Transition};
pub use locks::{LockGuard, LockManager};
pub use relay::Relay;
