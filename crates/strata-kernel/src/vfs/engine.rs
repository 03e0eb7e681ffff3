//! The log-structured store.
//!
//! [`Vfs`] owns the container, the index, and the descriptor table behind a
//! single mutex. File bytes are written in place when a write keeps a
//! file's size, and appended otherwise; the superseded range is counted as
//! waste and reclaimed by compaction. The index itself is persisted lazily
//! by the maintenance thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use strata_types::attr::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use strata_types::{DirEntry, FileAttr, FileType, OpenFlags, VfsError, VfsResult};

use super::compactor::{self, CompactionPolicy, CompactionReport, Urgency};
use super::fd::FdTable;
use super::index::{Extent, Index, Loaded, Metadata};
use super::maintenance::{self, Maintained, Maintenance};
use super::path::{self, ROOT};
use super::store::{BinaryStore, HEADER_LEN};
use super::now_ms;
use crate::config::StoreConfig;
use crate::sync::{ContentSource, EventKind, EventQueue, MirrorTarget, NativeMirror, SyncOp, SyncQueue};

/// Symlink hops allowed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 40;

const SYMLINK_MODE: u32 = 0o777;

/// A change observed in native storage, applied without echoing back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalContent {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

/// Space accounting and table sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VfsStats {
    pub container_len: u64,
    pub wasted: u64,
    pub live_bytes: u64,
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub open_fds: usize,
    pub index_dirty: bool,
}

#[derive(Debug)]
struct VfsState {
    store: BinaryStore,
    index: Index,
    wasted: u64,
    dirty: bool,
    fds: FdTable,
    max_file_size: u64,
}

/// The VFS-backed store.
pub struct Vfs {
    state: Mutex<VfsState>,
    events: Arc<EventQueue>,
    mirror: Option<Arc<SyncQueue>>,
    maintenance: Arc<Maintenance>,
    worker: Mutex<Option<JoinHandle<()>>>,
    policy: CompactionPolicy,
    flush_debounce: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("container", &self.state.lock().store.path())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

impl Vfs {
    /// Open (or create) the container and start maintenance.
    ///
    /// With a `mirror` target every mutation is also queued for write-behind
    /// into that host directory.
    pub fn open(
        config: &StoreConfig,
        events: Arc<EventQueue>,
        mirror: Option<MirrorTarget>,
    ) -> VfsResult<Arc<Self>> {
        let policy = config.compaction_policy();
        let mut store = BinaryStore::open(&config.container)?;

        let loaded = match store.read_index()? {
            Some(bytes) => (Index::decode(&bytes), bytes.len() as u64),
            None => (Loaded::Fresh("no index header".into()), 0),
        };
        let (index, wasted) = match loaded {
            (Loaded::Ready(mut index), index_len) => {
                quarantine_out_of_range(&mut index, HEADER_LEN + index_len, store.len());
                let wasted = recompute_wasted(&index, &store, index_len, policy.index_reserve);
                tracing::info!(
                    container = %config.container.display(),
                    files = index.files.len(),
                    dirs = index.dirs.len(),
                    wasted,
                    "loaded index"
                );
                (index, wasted)
            }
            (Loaded::Fresh(reason), _) => {
                if !store.is_empty() {
                    tracing::warn!(container = %config.container.display(), %reason, "cold start");
                }
                let mut index = Index::default();
                compactor::compact(&mut store, &mut index, policy.index_reserve)?;
                (index, 0)
            }
        };

        let native = match mirror {
            Some(target) => Some((NativeMirror::new(&target.root)?, target.sync)),
            None => None,
        };

        let maintenance = Maintenance::new(policy);
        let vfs = Arc::new_cyclic(|weak: &Weak<Vfs>| {
            let mirror = native.map(|(native, sync)| {
                let source: Weak<dyn ContentSource> = weak.clone();
                SyncQueue::start(native, sync, source)
            });
            Vfs {
                state: Mutex::new(VfsState {
                    store,
                    index,
                    wasted,
                    dirty: false,
                    fds: FdTable::default(),
                    max_file_size: config.max_file_size,
                }),
                events,
                mirror,
                maintenance: maintenance.clone(),
                worker: Mutex::new(None),
                policy,
                flush_debounce: config.flush_debounce(),
                closed: AtomicBool::new(false),
            }
        });

        let handle = maintenance::spawn(maintenance, Arc::downgrade(&vfs))?;
        *vfs.worker.lock() = Some(handle);
        Ok(vfs)
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn mirror(&self) -> Option<&Arc<SyncQueue>> {
        self.mirror.as_ref()
    }

    fn lock(&self) -> VfsResult<MutexGuard<'_, VfsState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VfsError::other("store is closed"));
        }
        self.maintenance.touch();
        Ok(self.state.lock())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Whole contents of a file.
    pub fn read(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let extent = file_extent(&state.index, &resolved)?;
        state.store.read_at(extent.offset, extent.size)
    }

    /// Up to `len` bytes starting at `start`; short at end of file.
    pub fn read_range(&self, path: &str, start: u64, len: u64) -> VfsResult<Vec<u8>> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        read_range_locked(&mut state, &resolved, start, len)
    }

    pub fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        match state.index.kind_of(&resolved) {
            Some(FileType::Directory) => Ok(state.index.children(&resolved)),
            Some(_) => Err(VfsError::not_a_directory(resolved)),
            None => Err(VfsError::not_found(resolved)),
        }
    }

    pub fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        attr_of(&state.index, &resolved)
    }

    pub fn lstat(&self, path: &str) -> VfsResult<FileAttr> {
        let state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        attr_of(&state.index, &resolved)
    }

    pub fn exists(&self, path: &str) -> VfsResult<bool> {
        let state = self.lock()?;
        Ok(match resolve(&state.index, path, true) {
            Ok(resolved) => state.index.exists(&resolved),
            Err(_) => false,
        })
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        match state.index.symlinks.get(&resolved) {
            Some(target) => Ok(target.clone()),
            None if state.index.exists(&resolved) => Err(VfsError::NotASymlink(resolved)),
            None => Err(VfsError::not_found(resolved)),
        }
    }

    // ------------------------------------------------------------------
    // File content
    // ------------------------------------------------------------------

    /// Replace a file's contents, creating it if needed.
    pub fn write(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let now = now_ms();
        let created = self.put_file(&mut state, &resolved, data, now, None)?;
        self.record(created_or_updated(created), &resolved, now);
        self.mirror_op(SyncOp::Write { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    /// Append to a file, creating it if needed.
    pub fn append(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let now = now_ms();

        let created = match state.index.files.get(&resolved).copied() {
            Some(extent) if extent.end() == state.store.len() && extent.size > 0 => {
                let size = grown_size(&state, &resolved, extent.size, data.len() as u64)?;
                // Last range in the container: grow it in place.
                state.store.append(data)?;
                let grown = Extent {
                    offset: extent.offset,
                    size,
                };
                state.index.files.insert(resolved.clone(), grown);
                touch_meta(&mut state.index, &resolved, DEFAULT_FILE_MODE, now);
                false
            }
            Some(extent) => {
                grown_size(&state, &resolved, extent.size, data.len() as u64)?;
                let mut combined = state.store.read_at(extent.offset, extent.size)?;
                combined.extend_from_slice(data);
                self.put_file(&mut state, &resolved, &combined, now, None)?
            }
            None => self.put_file(&mut state, &resolved, data, now, None)?,
        };
        self.record(created_or_updated(created), &resolved, now);
        self.mirror_op(SyncOp::Write { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    /// Resize a file, zero-filling on growth.
    pub fn truncate(&self, path: &str, len: u64) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let now = now_ms();
        truncate_locked(&mut state, &resolved, len, now)?;
        self.record(EventKind::Update, &resolved, now);
        self.mirror_op(SyncOp::Write { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    /// Write `data` at `offset` inside a file, extending it if needed.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let now = now_ms();
        write_at_locked(&mut state, &resolved, offset, data, now)?;
        self.record(EventKind::Update, &resolved, now);
        self.mirror_op(SyncOp::Write { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Namespace
    // ------------------------------------------------------------------

    /// Remove a file or symlink.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        match state.index.kind_of(&resolved) {
            Some(FileType::Directory) => return Err(VfsError::is_a_directory(resolved)),
            None => return Err(VfsError::not_found(resolved)),
            Some(_) => {}
        }
        if let Some(extent) = state.index.remove(&resolved) {
            state.wasted += extent.size;
        }
        self.record(EventKind::Delete, &resolved, now_ms());
        self.mirror_op(SyncOp::Remove { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    /// Create a directory. With `recursive`, missing ancestors are created
    /// and an existing directory is not an error.
    pub fn mkdir(&self, path: &str, recursive: bool, mode: Option<u32>) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        let mode = mode.unwrap_or(DEFAULT_DIR_MODE);

        if let Some(kind) = state.index.kind_of(&resolved) {
            return if recursive && kind.is_dir() {
                Ok(())
            } else {
                Err(VfsError::already_exists(resolved))
            };
        }

        let now = now_ms();
        let mut created = Vec::new();
        if recursive {
            for ancestor in path::ancestors(&resolved) {
                match state.index.kind_of(ancestor) {
                    Some(FileType::Directory) => {}
                    Some(_) => return Err(VfsError::not_a_directory(ancestor)),
                    None => created.push(ancestor.to_string()),
                }
            }
        } else {
            ensure_parent(&state.index, &resolved)?;
        }
        created.push(resolved);

        for dir in &created {
            state.index.dirs.insert(dir.clone());
            state.index.metadata.insert(dir.clone(), Metadata::new(mode, now));
            self.record(EventKind::Create, dir, now);
            self.mirror_op(SyncOp::Mkdir { path: dir.clone() });
        }
        self.mutated(&mut state);
        if recursive {
            // Recursive creation is durable before it returns.
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Remove a directory; `recursive` removes its contents too.
    pub fn rmdir(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        if resolved == ROOT {
            return Err(VfsError::permission_denied("cannot remove /"));
        }
        match state.index.kind_of(&resolved) {
            Some(FileType::Directory) => {}
            Some(_) => return Err(VfsError::not_a_directory(resolved)),
            None => return Err(VfsError::not_found(resolved)),
        }
        let descendants = state.index.descendants(&resolved);
        if !descendants.is_empty() && !recursive {
            return Err(VfsError::directory_not_empty(resolved));
        }

        let now = now_ms();
        for child in descendants.iter().rev() {
            if let Some(extent) = state.index.remove(child) {
                state.wasted += extent.size;
            }
            self.record(EventKind::Delete, child, now);
        }
        state.index.remove(&resolved);
        self.record(EventKind::Delete, &resolved, now);
        self.mirror_op(SyncOp::Remove { path: resolved });
        self.mutated(&mut state);
        Ok(())
    }

    /// Move a file, symlink, or directory tree. Bytes stay where they are;
    /// only index keys change.
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let mut state = self.lock()?;
        let from = resolve(&state.index, from, false)?;
        let to = resolve(&state.index, to, false)?;
        if from == ROOT || to == ROOT {
            return Err(VfsError::permission_denied("cannot rename /"));
        }
        let Some(kind) = state.index.kind_of(&from) else {
            return Err(VfsError::not_found(from));
        };
        if from == to {
            return Ok(());
        }
        if path::is_descendant(&to, &from) {
            return Err(VfsError::invalid_argument(format!(
                "cannot move {from} into itself ({to})"
            )));
        }
        ensure_parent(&state.index, &to)?;

        match (kind, state.index.kind_of(&to)) {
            (_, None) => {}
            (FileType::Directory, Some(FileType::Directory)) => {
                if state.index.has_children(&to) {
                    return Err(VfsError::directory_not_empty(to));
                }
                state.index.remove(&to);
            }
            (FileType::Directory, Some(_)) => return Err(VfsError::not_a_directory(to)),
            (_, Some(FileType::Directory)) => return Err(VfsError::is_a_directory(to)),
            (_, Some(_)) => {
                if let Some(extent) = state.index.remove(&to) {
                    state.wasted += extent.size;
                }
            }
        }

        let mut moved = state.index.descendants(&from);
        moved.insert(0, from.clone());
        let index = &mut state.index;
        for old in &moved {
            let new = path::rebase(old, &from, &to);
            if let Some(extent) = index.files.remove(old) {
                index.files.insert(new.clone(), extent);
            }
            if index.dirs.remove(old) {
                index.dirs.insert(new.clone());
            }
            if let Some(target) = index.symlinks.remove(old) {
                index.symlinks.insert(new.clone(), target);
            }
            if let Some(meta) = index.metadata.remove(old) {
                index.metadata.insert(new.clone(), meta);
            }
            if let Some(raw) = index.corrupt.remove(old) {
                index.corrupt.insert(new, raw);
            }
        }
        state.fds.retarget(&from, &to);

        let now = now_ms();
        self.record(EventKind::Delete, &from, now);
        self.mirror_op(SyncOp::Remove { path: from.clone() });
        for old in &moved {
            let new = path::rebase(old, &from, &to);
            self.record(EventKind::Create, &new, now);
            let op = match state.index.kind_of(&new) {
                Some(FileType::Directory) => SyncOp::Mkdir { path: new },
                Some(FileType::Symlink) => SyncOp::Symlink {
                    target: state.index.symlinks.get(&new).cloned().unwrap_or_default(),
                    path: new,
                },
                _ => SyncOp::Write { path: new },
            };
            self.mirror_op(op);
        }
        self.mutated(&mut state);
        Ok(())
    }

    /// Copy a file's bytes and mode to a new path.
    pub fn copy(&self, from: &str, to: &str) -> VfsResult<()> {
        let mut state = self.lock()?;
        let from = resolve(&state.index, from, true)?;
        let to = resolve(&state.index, to, true)?;
        let extent = file_extent(&state.index, &from)?;
        let bytes = state.store.read_at(extent.offset, extent.size)?;
        let mode = state.index.metadata.get(&from).map(|m| m.mode);

        let now = now_ms();
        let created = self.put_file(&mut state, &to, &bytes, now, mode)?;
        self.record(created_or_updated(created), &to, now);
        self.mirror_op(SyncOp::Write { path: to });
        self.mutated(&mut state);
        Ok(())
    }

    /// Hard link. Emulated by duplicating content, so the two paths diverge
    /// on the next write to either.
    pub fn link(&self, existing: &str, new: &str) -> VfsResult<()> {
        let mut state = self.lock()?;
        let existing = resolve(&state.index, existing, true)?;
        let new = resolve(&state.index, new, false)?;
        if state.index.exists(&new) {
            return Err(VfsError::already_exists(new));
        }
        let extent = file_extent(&state.index, &existing)?;
        let bytes = state.store.read_at(extent.offset, extent.size)?;
        let mode = state.index.metadata.get(&existing).map(|m| m.mode);

        let now = now_ms();
        self.put_file(&mut state, &new, &bytes, now, mode)?;
        self.record(EventKind::Create, &new, now);
        self.mirror_op(SyncOp::Write { path: new });
        self.mutated(&mut state);
        Ok(())
    }

    /// Create a symlink at `path` pointing to `target` (stored verbatim).
    pub fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, false)?;
        if state.index.exists(&resolved) {
            return Err(VfsError::already_exists(resolved));
        }
        ensure_parent(&state.index, &resolved)?;

        let now = now_ms();
        state.index.symlinks.insert(resolved.clone(), target.to_string());
        state
            .index
            .metadata
            .insert(resolved.clone(), Metadata::new(SYMLINK_MODE, now));
        self.record(EventKind::Create, &resolved, now);
        self.mirror_op(SyncOp::Symlink {
            path: resolved,
            target: target.to_string(),
        });
        self.mutated(&mut state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata only
    // ------------------------------------------------------------------

    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.update_meta(path, |meta| meta.mode = mode & 0o7777)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        self.update_meta(path, |meta| {
            meta.uid = uid;
            meta.gid = gid;
        })
    }

    pub fn utimes(&self, path: &str, atime: u64, mtime: u64) -> VfsResult<()> {
        self.update_meta(path, |meta| {
            meta.atime = atime;
            meta.mtime = mtime;
        })
    }

    fn update_meta(&self, path: &str, apply: impl FnOnce(&mut Metadata)) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let Some(kind) = state.index.kind_of(&resolved) else {
            return Err(VfsError::not_found(resolved));
        };
        let meta = state
            .index
            .metadata
            .entry(resolved)
            .or_insert_with(|| Metadata::new(default_mode(kind), 0));
        apply(meta);
        state.dirty = true;
        self.maintenance.request_flush(self.flush_debounce);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    pub fn open_fd(&self, path: &str, flags: OpenFlags, mode: Option<u32>) -> VfsResult<u32> {
        let mut state = self.lock()?;
        let resolved = resolve(&state.index, path, true)?;
        let now = now_ms();

        let event = match state.index.kind_of(&resolved) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(VfsError::already_exists(resolved));
            }
            Some(FileType::Directory) if flags.write => {
                return Err(VfsError::is_a_directory(resolved));
            }
            Some(FileType::File) if flags.truncate && flags.write => {
                truncate_locked(&mut state, &resolved, 0, now)?;
                Some(EventKind::Update)
            }
            Some(_) => None,
            None if flags.create => {
                self.put_file(&mut state, &resolved, &[], now, mode)?;
                Some(EventKind::Create)
            }
            None => return Err(VfsError::not_found(resolved)),
        };

        if let Some(kind) = event {
            self.record(kind, &resolved, now);
            self.mirror_op(SyncOp::Write {
                path: resolved.clone(),
            });
            self.mutated(&mut state);
        }
        Ok(state.fds.insert(resolved, flags))
    }

    pub fn close(&self, fd: u32) -> VfsResult<()> {
        let mut state = self.lock()?;
        state.fds.remove(fd).map(|_| ())
    }

    /// Read through a descriptor. Without `position` the cursor advances.
    pub fn read_fd(&self, fd: u32, len: u64, position: Option<u64>) -> VfsResult<Vec<u8>> {
        let mut state = self.lock()?;
        let file = state.fds.get(fd)?.clone();
        if !file.flags.read {
            return Err(VfsError::BadDescriptor(format!("{fd} not open for reading")));
        }
        let start = position.unwrap_or(file.cursor);
        let bytes = read_range_locked(&mut state, &file.path, start, len)?;
        if position.is_none() {
            state.fds.get_mut(fd)?.cursor = start + bytes.len() as u64;
        }
        Ok(bytes)
    }

    /// Write through a descriptor, returning the byte count. `Append`
    /// descriptors always write at end of file.
    pub fn write_fd(&self, fd: u32, data: &[u8], position: Option<u64>) -> VfsResult<u64> {
        let mut state = self.lock()?;
        let file = state.fds.get(fd)?.clone();
        if !file.flags.write {
            return Err(VfsError::BadDescriptor(format!("{fd} not open for writing")));
        }
        let offset = if file.flags.append {
            file_extent(&state.index, &file.path)?.size
        } else {
            position.unwrap_or(file.cursor)
        };

        let now = now_ms();
        let end = write_at_locked(&mut state, &file.path, offset, data, now)?;
        if position.is_none() || file.flags.append {
            state.fds.get_mut(fd)?.cursor = end;
        }
        self.record(EventKind::Update, &file.path, now);
        self.mirror_op(SyncOp::Write { path: file.path });
        self.mutated(&mut state);
        Ok(data.len() as u64)
    }

    pub fn fstat(&self, fd: u32) -> VfsResult<FileAttr> {
        let state = self.lock()?;
        let file = state.fds.get(fd)?;
        attr_of(&state.index, &file.path)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persist the index now.
    pub fn flush(&self) -> VfsResult<()> {
        let mut state = self.lock()?;
        self.flush_locked(&mut state)
    }

    /// Compact now, regardless of how much is wasted.
    pub fn compact(&self) -> VfsResult<CompactionReport> {
        let mut state = self.lock()?;
        self.compact_locked(&mut state)
    }

    /// Every path in the index, sorted.
    pub fn list_paths(&self) -> VfsResult<Vec<String>> {
        Ok(self.lock()?.index.all_paths())
    }

    pub fn stats(&self) -> VfsResult<VfsStats> {
        let state = self.lock()?;
        Ok(VfsStats {
            container_len: state.store.len(),
            wasted: state.wasted,
            live_bytes: state.index.live_bytes(),
            files: state.index.files.len(),
            dirs: state.index.dirs.len(),
            symlinks: state.index.symlinks.len(),
            open_fds: state.fds.len(),
            index_dirty: state.dirty,
        })
    }

    /// Apply a change that originated in native storage. Queues no event
    /// and no write-behind, so it cannot echo back out.
    pub fn import_external(&self, path: &str, content: ExternalContent, mtime: u64) -> VfsResult<()> {
        let mut state = self.lock()?;
        let resolved = path::normalize(path)?;
        if resolved == ROOT {
            return Ok(());
        }
        for ancestor in path::ancestors(&resolved) {
            match state.index.kind_of(ancestor) {
                Some(FileType::Directory) => {}
                Some(_) => return Err(VfsError::not_a_directory(ancestor)),
                None => {
                    state.index.dirs.insert(ancestor.to_string());
                    state
                        .index
                        .metadata
                        .insert(ancestor.to_string(), Metadata::new(DEFAULT_DIR_MODE, mtime));
                }
            }
        }

        match content {
            ExternalContent::File(bytes) => {
                if state.index.kind_of(&resolved).is_some_and(|k| !k.is_file()) {
                    remove_tree(&mut state, &resolved);
                }
                self.put_file(&mut state, &resolved, &bytes, mtime, None)?;
            }
            ExternalContent::Directory => {
                match state.index.kind_of(&resolved) {
                    Some(FileType::Directory) => {}
                    Some(_) => {
                        remove_tree(&mut state, &resolved);
                        insert_dir(&mut state.index, &resolved, mtime);
                    }
                    None => insert_dir(&mut state.index, &resolved, mtime),
                }
            }
            ExternalContent::Symlink(target) => {
                remove_tree(&mut state, &resolved);
                state.index.symlinks.insert(resolved.clone(), target);
                state
                    .index
                    .metadata
                    .insert(resolved, Metadata::new(SYMLINK_MODE, mtime));
            }
        }
        self.mutated(&mut state);
        Ok(())
    }

    /// Remove a path (and anything below it) deleted in native storage.
    pub fn remove_external(&self, path: &str) -> VfsResult<bool> {
        let mut state = self.lock()?;
        let resolved = path::normalize(path)?;
        if resolved == ROOT || !state.index.exists(&resolved) {
            return Ok(false);
        }
        remove_tree(&mut state, &resolved);
        self.mutated(&mut state);
        Ok(true)
    }

    /// Stop maintenance and write-behind, flush, and refuse further calls.
    pub fn close_store(&self) -> VfsResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.maintenance.shutdown();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(mirror) = &self.mirror {
            mirror.shutdown();
        }

        let mut state = self.state.lock();
        state.fds.clear();
        self.flush_locked(&mut state)?;
        state.store.sync()?;
        tracing::debug!(container = %state.store.path().display(), "store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Store `data` as the full contents of `path`. Returns true if the file
    /// did not exist before.
    fn put_file(
        &self,
        state: &mut VfsState,
        path: &str,
        data: &[u8],
        now: u64,
        mode: Option<u32>,
    ) -> VfsResult<bool> {
        check_size(state, path, data.len() as u64)?;
        let created = match state.index.kind_of(path) {
            Some(FileType::Directory) => return Err(VfsError::is_a_directory(path)),
            Some(_) => false,
            None => {
                ensure_parent(&state.index, path)?;
                true
            }
        };
        store_bytes(state, path, data)?;
        let meta = state
            .index
            .metadata
            .entry(path.to_string())
            .or_insert_with(|| Metadata::new(mode.unwrap_or(DEFAULT_FILE_MODE), now));
        meta.mtime = now;
        Ok(created)
    }

    /// Only a mirrored store produces native notifications to settle
    /// pending entries; otherwise the mutation is just counted.
    fn record(&self, kind: EventKind, path: &str, mtime: u64) {
        match self.mirror {
            Some(_) => self.events.queue(kind, path, mtime),
            None => self.events.count(kind),
        }
    }

    fn mirror_op(&self, op: SyncOp) {
        if let Some(mirror) = &self.mirror {
            mirror.enqueue(op);
        }
    }

    /// Bookkeeping after any mutation: dirty the index and assess waste.
    fn mutated(&self, state: &mut VfsState) {
        state.dirty = true;
        match self.policy.assess(state.wasted) {
            Urgency::Urgent => {
                if let Err(e) = self.compact_locked(state) {
                    tracing::error!(error = %e, wasted = state.wasted, "urgent compaction failed");
                }
            }
            Urgency::Scheduled => {
                if !self.maintenance.compaction_pending() {
                    tracing::debug!(wasted = state.wasted, "compaction scheduled");
                }
                self.maintenance.request_compaction();
            }
            Urgency::None => {}
        }
        if state.dirty {
            self.maintenance.request_flush(self.flush_debounce);
        }
    }

    /// Write the index, compacting instead if it would reach file data.
    fn flush_locked(&self, state: &mut VfsState) -> VfsResult<()> {
        if !state.dirty {
            return Ok(());
        }
        let bytes = state.index.encode()?;
        let index_end = HEADER_LEN + bytes.len() as u64;
        if state.index.lowest_offset().is_some_and(|lowest| index_end > lowest) {
            tracing::debug!(index_end, "index would overlap file data, compacting");
            self.compact_locked(state)?;
            return Ok(());
        }
        state.store.write_index(&bytes)?;
        state.store.sync()?;
        state.dirty = false;
        tracing::trace!(index_len = bytes.len(), "index flushed");
        Ok(())
    }

    fn compact_locked(&self, state: &mut VfsState) -> VfsResult<CompactionReport> {
        let report = compactor::compact(&mut state.store, &mut state.index, self.policy.index_reserve)?;
        state.wasted = 0;
        state.dirty = false;
        self.maintenance.cancel_compaction();
        tracing::info!(
            before = report.before,
            after = report.after,
            live = report.live_bytes,
            "compacted container"
        );
        Ok(report)
    }
}

impl Maintained for Vfs {
    fn flush_index(&self) -> VfsResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn compact_scheduled(&self) -> VfsResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.policy.assess(state.wasted) == Urgency::None {
            return Ok(());
        }
        self.compact_locked(&mut state).map(|_| ())
    }
}

impl ContentSource for Vfs {
    fn content(&self, path: &str) -> VfsResult<Option<(Vec<u8>, u64)>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let Some(extent) = state.index.files.get(path).copied() else {
            return Ok(None);
        };
        let mtime = state.index.metadata.get(path).map_or_else(now_ms, |m| m.mtime);
        let bytes = state.store.read_at(extent.offset, extent.size)?;
        Ok(Some((bytes, mtime)))
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        // The maintenance thread may be the one dropping us, so only signal.
        self.maintenance.shutdown();
        if let Some(mirror) = &self.mirror {
            mirror.signal_shutdown();
        }
        if !self.closed.load(Ordering::Acquire) {
            let state = self.state.get_mut();
            if state.dirty {
                if let Ok(bytes) = state.index.encode() {
                    let fits = state
                        .index
                        .lowest_offset()
                        .is_none_or(|lowest| HEADER_LEN + bytes.len() as u64 <= lowest);
                    if fits {
                        let _ = state.store.write_index(&bytes);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Helpers on the locked state
// ----------------------------------------------------------------------

fn created_or_updated(created: bool) -> EventKind {
    if created {
        EventKind::Create
    } else {
        EventKind::Update
    }
}

fn default_mode(kind: FileType) -> u32 {
    match kind {
        FileType::Directory => DEFAULT_DIR_MODE,
        FileType::Symlink => SYMLINK_MODE,
        FileType::File => DEFAULT_FILE_MODE,
    }
}

/// Normalize `path` and follow symlinks in its directory components, and in
/// the final component too when `follow_last` is set.
fn resolve(index: &Index, path: &str, follow_last: bool) -> VfsResult<String> {
    let original = path;
    let mut current = path::normalize(path)?;
    let mut hops = 0;
    loop {
        let hit = {
            let mut candidates = path::ancestors(&current);
            if follow_last && current != ROOT {
                candidates.push(&current);
            }
            candidates.into_iter().find_map(|prefix| {
                index
                    .symlinks
                    .get(prefix)
                    .map(|target| (prefix.to_string(), target.clone()))
            })
        };
        let Some((link, target)) = hit else {
            return Ok(current);
        };
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(VfsError::TooManySymlinks(original.to_string()));
        }
        let base = path::resolve_target(&link, &target)?;
        let rest = &current[link.len()..];
        current = path::normalize(&format!("{base}{rest}"))?;
    }
}

fn ensure_parent(index: &Index, path: &str) -> VfsResult<()> {
    let Some(parent) = path::parent(path) else {
        return Ok(());
    };
    match index.kind_of(parent) {
        Some(FileType::Directory) => Ok(()),
        Some(_) => Err(VfsError::not_a_directory(parent)),
        None => Err(VfsError::not_found(parent)),
    }
}

fn file_extent(index: &Index, path: &str) -> VfsResult<Extent> {
    if let Some(extent) = index.files.get(path) {
        return Ok(*extent);
    }
    if index.corrupt.contains_key(path) {
        return Err(VfsError::corruption(format!("{path}: invalid extent in index")));
    }
    match index.kind_of(path) {
        Some(FileType::Directory) => Err(VfsError::is_a_directory(path)),
        Some(_) => Err(VfsError::invalid_argument(format!("{path} is not a regular file"))),
        None => Err(VfsError::not_found(path)),
    }
}

fn attr_of(index: &Index, path: &str) -> VfsResult<FileAttr> {
    let (kind, size) = match index.kind_of(path) {
        Some(FileType::File) => (FileType::File, file_extent(index, path)?.size),
        Some(FileType::Symlink) => (
            FileType::Symlink,
            index.symlinks.get(path).map_or(0, |t| t.len() as u64),
        ),
        Some(FileType::Directory) => (FileType::Directory, 0),
        None => return Err(VfsError::not_found(path)),
    };
    let meta = index
        .metadata
        .get(path)
        .copied()
        .unwrap_or_else(|| Metadata::new(default_mode(kind), 0));
    Ok(FileAttr {
        size,
        kind,
        mode: meta.mode,
        uid: meta.uid,
        gid: meta.gid,
        mtime: meta.mtime,
        atime: meta.atime,
        nlink: if kind.is_dir() { 2 } else { 1 },
    })
}

fn touch_meta(index: &mut Index, path: &str, mode: u32, now: u64) {
    index
        .metadata
        .entry(path.to_string())
        .or_insert_with(|| Metadata::new(mode, now))
        .mtime = now;
}

fn insert_dir(index: &mut Index, path: &str, mtime: u64) {
    index.dirs.insert(path.to_string());
    index
        .metadata
        .insert(path.to_string(), Metadata::new(DEFAULT_DIR_MODE, mtime));
}

/// Write bytes for `path`: in place when the size is unchanged, otherwise
/// appended with the old range counted as waste.
fn store_bytes(state: &mut VfsState, path: &str, data: &[u8]) -> VfsResult<()> {
    let size = data.len() as u64;
    state.index.corrupt.remove(path);
    let extent = match state.index.files.get(path).copied() {
        Some(old) if old.size == size => {
            if size > 0 {
                state.store.write_at(old.offset, data)?;
            }
            old
        }
        old => {
            if let Some(old) = old {
                state.wasted += old.size;
            }
            let offset = if size > 0 {
                state.store.append(data)?
            } else {
                state.store.len()
            };
            Extent { offset, size }
        }
    };
    state.index.files.insert(path.to_string(), extent);
    Ok(())
}

fn read_range_locked(state: &mut VfsState, path: &str, start: u64, len: u64) -> VfsResult<Vec<u8>> {
    let extent = file_extent(&state.index, path)?;
    if start >= extent.size {
        return Ok(Vec::new());
    }
    let len = len.min(extent.size - start);
    state.store.read_at(extent.offset + start, len)
}

fn truncate_locked(state: &mut VfsState, path: &str, len: u64, now: u64) -> VfsResult<()> {
    let extent = file_extent(&state.index, path)?;
    if len <= extent.size {
        state.wasted += extent.size - len;
        state.index.files.insert(
            path.to_string(),
            Extent {
                offset: extent.offset,
                size: len,
            },
        );
    } else {
        check_size(state, path, len)?;
        let mut bytes = state.store.read_at(extent.offset, extent.size)?;
        bytes.resize(len as usize, 0);
        store_bytes(state, path, &bytes)?;
    }
    touch_meta(&mut state.index, path, DEFAULT_FILE_MODE, now);
    Ok(())
}

/// Returns the offset just past the written bytes.
fn write_at_locked(state: &mut VfsState, path: &str, offset: u64, data: &[u8], now: u64) -> VfsResult<u64> {
    let extent = file_extent(&state.index, path)?;
    let end = grown_size(state, path, offset, data.len() as u64)?;
    if end <= extent.size {
        state.store.write_at(extent.offset + offset, data)?;
    } else {
        let mut bytes = state.store.read_at(extent.offset, extent.size)?;
        bytes.resize(end as usize, 0);
        bytes[offset as usize..end as usize].copy_from_slice(data);
        store_bytes(state, path, &bytes)?;
    }
    touch_meta(&mut state.index, path, DEFAULT_FILE_MODE, now);
    Ok(end)
}

/// Refuse sizes above the configured maximum before anything is allocated.
fn check_size(state: &VfsState, path: &str, len: u64) -> VfsResult<()> {
    if len > state.max_file_size {
        return Err(VfsError::invalid_argument(format!(
            "{path}: size {len} exceeds the {} byte file limit",
            state.max_file_size
        )));
    }
    Ok(())
}

/// `start + len`, checked for overflow and against the file limit.
fn grown_size(state: &VfsState, path: &str, start: u64, len: u64) -> VfsResult<u64> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| VfsError::invalid_argument(format!("{path}: offset {start} + {len} overflows")))?;
    check_size(state, path, end)?;
    Ok(end)
}

/// Remove `path` and everything beneath it, counting freed bytes as waste.
fn remove_tree(state: &mut VfsState, path: &str) {
    for child in state.index.descendants(path) {
        if let Some(extent) = state.index.remove(&child) {
            state.wasted += extent.size;
        }
    }
    if let Some(extent) = state.index.remove(path) {
        state.wasted += extent.size;
    }
}

/// Move extents that cannot be valid for this container into `corrupt`.
fn quarantine_out_of_range(index: &mut Index, data_start: u64, end: u64) {
    let bad: Vec<String> = index
        .files
        .iter()
        .filter(|(_, e)| e.size > 0 && (e.offset < data_start || e.end() > end))
        .map(|(p, _)| p.clone())
        .collect();
    for path in bad {
        if let Some(extent) = index.files.remove(&path) {
            tracing::warn!(path = %path, offset = extent.offset, size = extent.size, "extent outside container");
            let raw = serde_json::json!({ "offset": extent.offset, "size": extent.size });
            index.corrupt.insert(path, raw);
        }
    }
}

fn recompute_wasted(index: &Index, store: &BinaryStore, index_len: u64, reserve: u64) -> u64 {
    let end = store.len();
    let live = index.live_bytes();
    match index.lowest_offset() {
        Some(lowest) => end.saturating_sub(lowest).saturating_sub(live),
        None => end.saturating_sub(HEADER_LEN + index_len + reserve),
    }
}
