//! Error taxonomy.
//!
//! [`VfsError`] is what the store, index, protocol and coordinator raise.
//! It travels across an arena or relay envelope as a [`WireError`] and is
//! handed back to the caller as a [`CallError`], which adds the originating
//! call and path.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Permission denied. Modes are stored but never enforced, so this is
    /// only raised for structural refusals such as removing `/`.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown or closed descriptor.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// Too many symbolic links.
    #[error("too many symbolic links: {0}")]
    TooManySymlinks(String),

    /// Bad lengths, offsets, or unparsable frames.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A protocol-level wait ran out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// No context currently owns the store.
    #[error("leader unavailable: {0}")]
    LeaderUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a BadDescriptor error.
    pub fn bad_descriptor(fd: u32) -> Self {
        Self::BadDescriptor(format!("fd {fd}"))
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a Corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a Timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a LeaderUnavailable error.
    pub fn leader_unavailable(msg: impl Into<String>) -> Self {
        Self::LeaderUnavailable(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// POSIX-style code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            VfsError::NotFound(_) => ErrorCode::Enoent,
            VfsError::AlreadyExists(_) => ErrorCode::Eexist,
            VfsError::NotADirectory(_) => ErrorCode::Enotdir,
            VfsError::IsADirectory(_) => ErrorCode::Eisdir,
            VfsError::DirectoryNotEmpty(_) => ErrorCode::Enotempty,
            VfsError::PermissionDenied(_) => ErrorCode::Eacces,
            VfsError::BadDescriptor(_) => ErrorCode::Ebadf,
            VfsError::InvalidArgument(_) | VfsError::NotASymlink(_) => ErrorCode::Einval,
            VfsError::TooManySymlinks(_) => ErrorCode::Eloop,
            VfsError::Corruption(_) => ErrorCode::Ebadmsg,
            VfsError::Timeout(_) => ErrorCode::Etimedout,
            VfsError::LeaderUnavailable(_) => ErrorCode::Eagain,
            VfsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorCode::Enoent,
                io::ErrorKind::AlreadyExists => ErrorCode::Eexist,
                io::ErrorKind::PermissionDenied => ErrorCode::Eacces,
                io::ErrorKind::NotADirectory => ErrorCode::Enotdir,
                io::ErrorKind::IsADirectory => ErrorCode::Eisdir,
                io::ErrorKind::DirectoryNotEmpty => ErrorCode::Enotempty,
                io::ErrorKind::InvalidInput => ErrorCode::Einval,
                _ => ErrorCode::Eio,
            },
            VfsError::Other(_) => ErrorCode::Eio,
        }
    }

    /// The detail carried by this error, without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            VfsError::NotFound(s)
            | VfsError::AlreadyExists(s)
            | VfsError::NotADirectory(s)
            | VfsError::IsADirectory(s)
            | VfsError::DirectoryNotEmpty(s)
            | VfsError::PermissionDenied(s)
            | VfsError::BadDescriptor(s)
            | VfsError::InvalidArgument(s)
            | VfsError::NotASymlink(s)
            | VfsError::TooManySymlinks(s)
            | VfsError::Corruption(s)
            | VfsError::Timeout(s)
            | VfsError::LeaderUnavailable(s)
            | VfsError::Other(s) => s.clone(),
            VfsError::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an error from its code and detail.
    ///
    /// Lossy for codes shared by several kinds (`EINVAL`, `EIO`).
    pub fn from_code(code: ErrorCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code {
            ErrorCode::Enoent => VfsError::NotFound(detail),
            ErrorCode::Eexist => VfsError::AlreadyExists(detail),
            ErrorCode::Enotdir => VfsError::NotADirectory(detail),
            ErrorCode::Eisdir => VfsError::IsADirectory(detail),
            ErrorCode::Enotempty => VfsError::DirectoryNotEmpty(detail),
            ErrorCode::Eacces => VfsError::PermissionDenied(detail),
            ErrorCode::Ebadf => VfsError::BadDescriptor(detail),
            ErrorCode::Einval => VfsError::InvalidArgument(detail),
            ErrorCode::Eloop => VfsError::TooManySymlinks(detail),
            ErrorCode::Ebadmsg => VfsError::Corruption(detail),
            ErrorCode::Etimedout => VfsError::Timeout(detail),
            ErrorCode::Eagain => VfsError::LeaderUnavailable(detail),
            ErrorCode::Eio => VfsError::Io(io::Error::other(detail)),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

/// POSIX-style error codes used on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ErrorCode {
    Enoent,
    Eexist,
    Enotdir,
    Eisdir,
    Enotempty,
    Eacces,
    Ebadf,
    Einval,
    Eloop,
    Ebadmsg,
    Etimedout,
    Eagain,
    Eio,
}

/// Serialized error carried in ERROR frames and relay responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error code.
    pub code: ErrorCode,
    /// Detail message.
    pub message: String,
    /// Method name of the originating call.
    pub syscall: String,
    /// Primary path of the originating call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WireError {
    /// Capture an error raised while executing `syscall` on `path`.
    pub fn new(error: &VfsError, syscall: impl Into<String>, path: Option<String>) -> Self {
        Self {
            code: error.code(),
            message: error.detail(),
            syscall: syscall.into(),
            path,
        }
    }

    /// Rebuild the structured error a caller receives.
    pub fn into_call_error(self) -> CallError {
        CallError {
            syscall: self.syscall,
            path: self.path,
            source: VfsError::from_code(self.code, self.message),
        }
    }
}

/// Error returned to a caller of a synchronous or relayed operation.
#[derive(Debug, Error)]
#[error("{syscall} {}: {source}", .path.as_deref().unwrap_or("-"))]
pub struct CallError {
    /// Method name of the originating call.
    pub syscall: String,
    /// Primary path of the originating call, if any.
    pub path: Option<String>,
    /// Underlying error.
    #[source]
    pub source: VfsError,
}

impl CallError {
    /// Wrap a locally raised error.
    pub fn new(source: VfsError, syscall: impl Into<String>, path: Option<String>) -> Self {
        Self {
            syscall: syscall.into(),
            path,
            source,
        }
    }

    /// POSIX-style code of the underlying error.
    pub fn code(&self) -> ErrorCode {
        self.source.code()
    }

    /// Serialized form for re-transmission.
    pub fn to_wire(&self) -> WireError {
        WireError::new(&self.source, self.syscall.clone(), self.path.clone())
    }
}

impl From<CallError> for VfsError {
    fn from(e: CallError) -> Self {
        e.source
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::Io(e) => e,
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::InvalidArgument(msg) | VfsError::NotASymlink(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            VfsError::Corruption(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            VfsError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_codes_render_as_errno_names() {
        assert_eq!(VfsError::not_found("/a").code().to_string(), "ENOENT");
        assert_eq!(VfsError::corruption("x").code().as_ref(), "EBADMSG");
        assert_eq!(ErrorCode::from_str("ENOTEMPTY").unwrap(), ErrorCode::Enotempty);
    }

    #[test]
    fn test_wire_roundtrip_keeps_call_context() {
        let err = VfsError::is_a_directory("/dir");
        let wire = WireError::new(&err, "read", Some("/dir".into()));
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"EISDIR\""));

        let back: WireError = serde_json::from_str(&json).unwrap();
        let call = back.into_call_error();
        assert_eq!(call.syscall, "read");
        assert_eq!(call.path.as_deref(), Some("/dir"));
        assert!(matches!(call.source, VfsError::IsADirectory(ref p) if p == "/dir"));
        assert_eq!(call.to_string(), "read /dir: is a directory: /dir");
    }

    #[test]
    fn test_io_errors_map_by_kind() {
        let err = VfsError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.code(), ErrorCode::Enoent);
        let err = VfsError::from(io::Error::other("disk"));
        assert_eq!(err.code(), ErrorCode::Eio);
    }
}
