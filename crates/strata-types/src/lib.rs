//! Shared types for strata.
//!
//! Everything that crosses a boundary lives here: the closed [`Op`] opcode
//! set that callers send, the [`Reply`] shapes that come back, file
//! attributes, the error taxonomy (including its wire form), and the
//! identifiers execution contexts use to address each other.

pub mod attr;
pub mod error;
pub mod ids;
pub mod op;

pub use attr::{DirEntry, FileAttr, FileType, OpenFlags};
pub use error::{CallError, ErrorCode, VfsError, VfsResult, WireError};
pub use ids::ContextId;
pub use op::{Op, Reply};
