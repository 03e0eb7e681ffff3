//! The seam between the executor and whatever actually stores files.
//!
//! An executor hands each decoded [`Op`] to a [`Backend`]. There are two:
//! the container-backed [`Vfs`] (used for both `Vfs` and `Hybrid` storage
//! modes) and the host-directory [`NativeBackend`].

use std::path::PathBuf;
use std::sync::Arc;

use strata_types::{Op, Reply, VfsError, VfsResult};

use crate::config::{StorageMode, StoreConfig, StrataConfig};
use crate::sync::{EventQueue, MirrorTarget, NativeWatcher, Reconciler};
use crate::vfs::{NativeBackend, Vfs};

/// Executes operations against one storage location.
pub trait Backend: Send + Sync {
    /// Run one operation to completion.
    fn execute(&self, op: Op) -> VfsResult<Reply>;

    /// Every path the backend holds, for diagnostic dumps.
    fn list_paths(&self) -> VfsResult<Vec<String>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Release everything held open. Further calls may fail.
    fn shutdown(&self);
}

impl Backend for Vfs {
    fn execute(&self, op: Op) -> VfsResult<Reply> {
        let reply = match op {
            Op::Read { path } => Reply::Bytes(self.read(&path)?),
            Op::ReadRange { path, start, len } => Reply::Bytes(self.read_range(&path, start, len)?),
            Op::Write { path, data } => {
                self.write(&path, &data)?;
                Reply::Unit
            }
            Op::Append { path, data } => {
                self.append(&path, &data)?;
                Reply::Unit
            }
            Op::Truncate { path, len } => {
                self.truncate(&path, len)?;
                Reply::Unit
            }
            Op::Unlink { path } => {
                self.unlink(&path)?;
                Reply::Unit
            }
            Op::Mkdir {
                path,
                recursive,
                mode,
            } => {
                self.mkdir(&path, recursive, mode)?;
                Reply::Unit
            }
            Op::Rmdir { path, recursive } => {
                self.rmdir(&path, recursive)?;
                Reply::Unit
            }
            Op::Readdir { path } => Reply::Entries(self.readdir(&path)?),
            Op::Rename { from, to } => {
                self.rename(&from, &to)?;
                Reply::Unit
            }
            Op::Copy { from, to } => {
                self.copy(&from, &to)?;
                Reply::Unit
            }
            Op::Link { existing, new } => {
                self.link(&existing, &new)?;
                Reply::Unit
            }
            Op::Stat { path } => Reply::Attr(self.stat(&path)?),
            Op::Lstat { path } => Reply::Attr(self.lstat(&path)?),
            Op::Exists { path } => Reply::Bool(self.exists(&path)?),
            Op::Chmod { path, mode } => {
                self.chmod(&path, mode)?;
                Reply::Unit
            }
            Op::Chown { path, uid, gid } => {
                self.chown(&path, uid, gid)?;
                Reply::Unit
            }
            Op::Utimes { path, atime, mtime } => {
                self.utimes(&path, atime, mtime)?;
                Reply::Unit
            }
            Op::Symlink { target, path } => {
                self.symlink(&target, &path)?;
                Reply::Unit
            }
            Op::Readlink { path } => Reply::Path(self.readlink(&path)?),
            Op::Open { path, flags, mode } => Reply::Fd(self.open_fd(&path, flags, mode)?),
            Op::Close { fd } => {
                self.close(fd)?;
                Reply::Unit
            }
            Op::ReadFd { fd, len, position } => Reply::Bytes(self.read_fd(fd, len, position)?),
            Op::WriteFd { fd, data, position } => Reply::Count(self.write_fd(fd, &data, position)?),
            Op::Fstat { fd } => Reply::Attr(self.fstat(fd)?),
            Op::Flush => {
                self.flush()?;
                Reply::Unit
            }
            Op::Compact => Reply::Count(self.compact()?.reclaimed()),
        };
        Ok(reply)
    }

    fn list_paths(&self) -> VfsResult<Vec<String>> {
        Vfs::list_paths(self)
    }

    fn name(&self) -> &'static str {
        if self.mirror().is_some() { "hybrid" } else { "vfs" }
    }

    fn shutdown(&self) {
        if let Err(e) = self.close_store() {
            tracing::error!(error = %e, "store close failed");
        }
    }
}

/// The storage a primary context opened, per [`StorageMode`].
#[derive(Clone)]
pub enum Storage {
    /// Container engine, optionally mirrored (`Vfs` and `Hybrid`).
    Container(Arc<Vfs>),
    Native(Arc<NativeBackend>),
}

impl Storage {
    /// Open whatever `config.store.mode` asks for.
    pub fn open(config: &StrataConfig, events: Arc<EventQueue>) -> VfsResult<Self> {
        let store = &config.store;
        let storage = match store.mode {
            StorageMode::Vfs => Storage::Container(Vfs::open(store, events, None)?),
            StorageMode::Hybrid => {
                let target = MirrorTarget {
                    root: native_root(store)?,
                    sync: config.sync.clone(),
                };
                Storage::Container(Vfs::open(store, events, Some(target))?)
            }
            StorageMode::Native => Storage::Native(Arc::new(NativeBackend::new(native_root(store)?)?)),
        };
        tracing::info!(backend = storage.backend().name(), mode = %store.mode, "storage opened");
        Ok(storage)
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        match self {
            Storage::Container(vfs) => vfs.clone(),
            Storage::Native(native) => native.clone(),
        }
    }

    pub fn vfs(&self) -> Option<&Arc<Vfs>> {
        match self {
            Storage::Container(vfs) => Some(vfs),
            Storage::Native(_) => None,
        }
    }

    /// Watch the mirror root for foreign changes. Only hybrid storage has one.
    ///
    /// Opens the event grace window first: notifications for mirror writes a
    /// previous owner still had in flight must not be imported as foreign.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, config: &StrataConfig) -> VfsResult<Option<(NativeWatcher, Arc<Reconciler>)>> {
        let Storage::Container(vfs) = self else {
            return Ok(None);
        };
        let Some(queue) = vfs.mirror() else {
            return Ok(None);
        };
        vfs.events().reset();
        let reconciler = Arc::new(Reconciler::new(vfs.clone(), queue.mirror().clone()));
        let watcher = NativeWatcher::start(reconciler.clone(), config.events.stale_after() / 2)?;
        Ok(Some((watcher, reconciler)))
    }
}

fn native_root(store: &StoreConfig) -> VfsResult<PathBuf> {
    store.native_root.clone().ok_or_else(|| {
        VfsError::invalid_argument(format!("store.mode {} requires store.native_root", store.mode))
    })
}
