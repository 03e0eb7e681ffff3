//! Applies write-behind operations to a host directory.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use strata_types::{VfsError, VfsResult};

/// A mirror operation with its bytes already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOp {
    /// `mtime` is stamped on the host file so its change notification
    /// reconciles as our own.
    Write {
        path: String,
        bytes: Vec<u8>,
        mtime: u64,
    },
    Mkdir { path: String },
    Remove { path: String },
    /// Not representable natively; counted and logged.
    Skip { path: String, reason: &'static str },
}

impl MirrorOp {
    pub fn path(&self) -> &str {
        match self {
            MirrorOp::Write { path, .. }
            | MirrorOp::Mkdir { path }
            | MirrorOp::Remove { path }
            | MirrorOp::Skip { path, .. } => path,
        }
    }
}

/// What happened to one mirror operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    Skipped,
}

/// A host directory receiving mirrored changes.
///
/// Store paths are mapped under `root`; anything that would escape it is
/// refused.
#[derive(Debug, Clone)]
pub struct NativeMirror {
    root: PathBuf,
}

impl NativeMirror {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host location of a store path.
    pub fn host_path(&self, path: &str) -> VfsResult<PathBuf> {
        let mut out = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(name) => out.push(name),
                Component::CurDir => {}
                _ => {
                    return Err(VfsError::permission_denied(format!(
                        "{path} escapes mirror root"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Store path of a host location under the root.
    pub fn store_path(&self, host: &Path) -> Option<String> {
        let rel = host.strip_prefix(&self.root).ok()?;
        let mut out = String::new();
        for component in rel.components() {
            let Component::Normal(name) = component else {
                return None;
            };
            out.push('/');
            out.push_str(name.to_str()?);
        }
        if out.is_empty() {
            out.push('/');
        }
        Some(out)
    }

    pub fn apply(&self, op: &MirrorOp) -> VfsResult<Applied> {
        match op {
            MirrorOp::Write { path, bytes, mtime } => {
                let host = self.host_path(path)?;
                if let Some(parent) = host.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&host, bytes)?;
                let file = std::fs::File::options().write(true).open(&host)?;
                file.set_modified(UNIX_EPOCH + Duration::from_millis(*mtime))?;
            }
            MirrorOp::Mkdir { path } => {
                std::fs::create_dir_all(self.host_path(path)?)?;
            }
            MirrorOp::Remove { path } => {
                let host = self.host_path(path)?;
                let result = match std::fs::symlink_metadata(&host) {
                    Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&host),
                    Ok(_) => std::fs::remove_file(&host),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            MirrorOp::Skip { path, reason } => {
                tracing::debug!(path = %path, reason, "mirror skipped");
                return Ok(Applied::Skipped);
            }
        }
        Ok(Applied::Done)
    }
}
