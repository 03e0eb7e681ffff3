//! The closed opcode set and its replies.
//!
//! Every logical filesystem call is one [`Op`] variant. Backends dispatch on
//! it with an exhaustive `match`, so adding an opcode is a compile error
//! everywhere it is not handled.
//!
//! Byte payloads are not part of the structured encoding: they are moved
//! out with [`Op::take_binary`] before the arguments are serialized and put
//! back with [`Op::splice_binary`] after decoding, so binary data never goes
//! through JSON.

use serde::{Deserialize, Serialize};

use crate::attr::{DirEntry, FileAttr, OpenFlags};
use crate::error::{VfsError, VfsResult};

/// A logical filesystem operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    /// Read a whole file.
    Read { path: String },
    /// Read `len` bytes starting at `start`.
    ReadRange { path: String, start: u64, len: u64 },
    /// Replace a file's contents, creating it if needed.
    Write {
        path: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// Append to a file, creating it if needed.
    Append {
        path: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// Resize a file, zero-filling on growth.
    Truncate { path: String, len: u64 },
    /// Remove a file or symlink.
    Unlink { path: String },
    /// Create a directory.
    Mkdir {
        path: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        mode: Option<u32>,
    },
    /// Remove a directory.
    Rmdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    /// List a directory.
    Readdir { path: String },
    /// Move a file or directory.
    Rename { from: String, to: String },
    /// Copy a file.
    Copy { from: String, to: String },
    /// Hard link, emulated by duplicating content.
    Link { existing: String, new: String },
    /// Attributes, following symlinks.
    Stat { path: String },
    /// Attributes of the link itself.
    Lstat { path: String },
    /// Whether a path resolves.
    Exists { path: String },
    /// Set permission bits (metadata only).
    Chmod { path: String, mode: u32 },
    /// Set ownership (metadata only).
    Chown { path: String, uid: u32, gid: u32 },
    /// Set access and modification times (metadata only).
    Utimes { path: String, atime: u64, mtime: u64 },
    /// Create a symlink at `path` pointing to `target`.
    Symlink { target: String, path: String },
    /// Read a symlink's target.
    Readlink { path: String },
    /// Open a descriptor.
    Open {
        path: String,
        flags: OpenFlags,
        #[serde(default)]
        mode: Option<u32>,
    },
    /// Close a descriptor.
    Close { fd: u32 },
    /// Read through a descriptor; `position` leaves the cursor alone.
    ReadFd {
        fd: u32,
        len: u64,
        #[serde(default)]
        position: Option<u64>,
    },
    /// Write through a descriptor; `position` leaves the cursor alone.
    WriteFd {
        fd: u32,
        #[serde(skip)]
        data: Vec<u8>,
        #[serde(default)]
        position: Option<u64>,
    },
    /// Attributes of an open descriptor.
    Fstat { fd: u32 },
    /// Persist the index before returning.
    Flush,
    /// Rewrite the container now.
    Compact,
}

impl Op {
    /// Read a whole file.
    pub fn read(path: impl Into<String>) -> Self {
        Op::Read { path: path.into() }
    }

    /// Replace a file's contents.
    pub fn write(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::Write {
            path: path.into(),
            data: data.into(),
        }
    }

    /// Remove a file.
    pub fn unlink(path: impl Into<String>) -> Self {
        Op::Unlink { path: path.into() }
    }

    /// Create a directory.
    pub fn mkdir(path: impl Into<String>, recursive: bool) -> Self {
        Op::Mkdir {
            path: path.into(),
            recursive,
            mode: None,
        }
    }

    /// List a directory.
    pub fn readdir(path: impl Into<String>) -> Self {
        Op::Readdir { path: path.into() }
    }

    /// Attributes, following symlinks.
    pub fn stat(path: impl Into<String>) -> Self {
        Op::Stat { path: path.into() }
    }

    /// Method name, as reported in errors and logs.
    pub fn method(&self) -> &'static str {
        self.into()
    }

    /// The path an operation primarily acts on.
    pub fn path(&self) -> Option<&str> {
        match self {
            Op::Read { path }
            | Op::ReadRange { path, .. }
            | Op::Write { path, .. }
            | Op::Append { path, .. }
            | Op::Truncate { path, .. }
            | Op::Unlink { path }
            | Op::Mkdir { path, .. }
            | Op::Rmdir { path, .. }
            | Op::Readdir { path }
            | Op::Stat { path }
            | Op::Lstat { path }
            | Op::Exists { path }
            | Op::Chmod { path, .. }
            | Op::Chown { path, .. }
            | Op::Utimes { path, .. }
            | Op::Symlink { path, .. }
            | Op::Readlink { path }
            | Op::Open { path, .. } => Some(path),
            Op::Rename { from, .. } | Op::Copy { from, .. } => Some(from),
            Op::Link { existing, .. } => Some(existing),
            Op::Close { .. }
            | Op::ReadFd { .. }
            | Op::WriteFd { .. }
            | Op::Fstat { .. }
            | Op::Flush
            | Op::Compact => None,
        }
    }

    /// Whether this operation changes logical filesystem content.
    pub fn is_mutation(&self) -> bool {
        match self {
            Op::Write { .. }
            | Op::Append { .. }
            | Op::Truncate { .. }
            | Op::Unlink { .. }
            | Op::Mkdir { .. }
            | Op::Rmdir { .. }
            | Op::Rename { .. }
            | Op::Copy { .. }
            | Op::Link { .. }
            | Op::Chmod { .. }
            | Op::Chown { .. }
            | Op::Utimes { .. }
            | Op::Symlink { .. }
            | Op::WriteFd { .. } => true,
            Op::Open { flags, .. } => flags.create || flags.truncate,
            _ => false,
        }
    }

    /// Whether this opcode carries a raw byte argument.
    pub fn has_binary_slot(&self) -> bool {
        matches!(self, Op::Write { .. } | Op::Append { .. } | Op::WriteFd { .. })
    }

    /// Move the raw byte argument out, leaving an empty buffer behind.
    pub fn take_binary(&mut self) -> Option<Vec<u8>> {
        match self {
            Op::Write { data, .. } | Op::Append { data, .. } | Op::WriteFd { data, .. } => {
                Some(std::mem::take(data))
            }
            _ => None,
        }
    }

    /// Put a raw byte argument back after decoding.
    ///
    /// Returns false when this opcode has no byte slot.
    pub fn splice_binary(&mut self, bytes: Vec<u8>) -> bool {
        match self {
            Op::Write { data, .. } | Op::Append { data, .. } | Op::WriteFd { data, .. } => {
                *data = bytes;
                true
            }
            _ => false,
        }
    }
}

/// Result of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// Nothing to return.
    Unit,
    /// File bytes. Sent as a raw-binary response, never as JSON.
    Bytes(Vec<u8>),
    /// File attributes.
    Attr(FileAttr),
    /// Directory listing.
    Entries(Vec<DirEntry>),
    /// A path (symlink target).
    Path(String),
    /// A descriptor.
    Fd(u32),
    /// A byte count.
    Count(u64),
    /// A yes/no answer.
    Bool(bool),
}

impl Reply {
    fn unexpected(&self, wanted: &str) -> VfsError {
        VfsError::corruption(format!("expected {wanted} reply, got {self:?}"))
    }

    /// Expect file bytes.
    pub fn into_bytes(self) -> VfsResult<Vec<u8>> {
        match self {
            Reply::Bytes(b) => Ok(b),
            other => Err(other.unexpected("bytes")),
        }
    }

    /// Expect attributes.
    pub fn into_attr(self) -> VfsResult<FileAttr> {
        match self {
            Reply::Attr(a) => Ok(a),
            other => Err(other.unexpected("attr")),
        }
    }

    /// Expect a directory listing.
    pub fn into_entries(self) -> VfsResult<Vec<DirEntry>> {
        match self {
            Reply::Entries(e) => Ok(e),
            other => Err(other.unexpected("entries")),
        }
    }

    /// Expect a path.
    pub fn into_path(self) -> VfsResult<String> {
        match self {
            Reply::Path(p) => Ok(p),
            other => Err(other.unexpected("path")),
        }
    }

    /// Expect a descriptor.
    pub fn into_fd(self) -> VfsResult<u32> {
        match self {
            Reply::Fd(fd) => Ok(fd),
            other => Err(other.unexpected("fd")),
        }
    }

    /// Expect a count.
    pub fn into_count(self) -> VfsResult<u64> {
        match self {
            Reply::Count(n) => Ok(n),
            other => Err(other.unexpected("count")),
        }
    }

    /// Expect a boolean.
    pub fn into_bool(self) -> VfsResult<bool> {
        match self {
            Reply::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_is_kept_out_of_json() {
        let mut op = Op::write("/a.txt", b"payload".to_vec());
        let bytes = op.take_binary().unwrap();
        assert_eq!(bytes, b"payload");

        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"method":"write","args":{"path":"/a.txt"}}"#);

        let mut decoded: Op = serde_json::from_str(&json).unwrap();
        assert!(decoded.splice_binary(bytes));
        assert_eq!(decoded, Op::write("/a.txt", b"payload".to_vec()));
    }

    #[test]
    fn test_method_and_path() {
        let op = Op::Rename {
            from: "/a".into(),
            to: "/b".into(),
        };
        assert_eq!(op.method(), "rename");
        assert_eq!(op.path(), Some("/a"));
        assert!(op.is_mutation());

        assert_eq!(Op::ReadFd { fd: 3, len: 1, position: None }.method(), "read_fd");
        assert_eq!(Op::Flush.path(), None);
        assert!(!Op::stat("/a").is_mutation());
    }

    #[test]
    fn test_unit_variants_and_defaults_decode() {
        let op: Op = serde_json::from_str(r#"{"method":"flush"}"#).unwrap();
        assert_eq!(op, Op::Flush);

        let op: Op = serde_json::from_str(r#"{"method":"mkdir","args":{"path":"/d"}}"#).unwrap();
        assert_eq!(op, Op::mkdir("/d", false));
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Fd(7).into_fd().unwrap(), 7);
        assert!(Reply::Unit.into_bytes().is_err());
    }
}
