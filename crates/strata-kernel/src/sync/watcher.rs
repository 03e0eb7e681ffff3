//! Importing foreign changes from native storage.
//!
//! A [`NativeWatcher`] forwards filesystem notifications for the mirror root
//! to a [`Reconciler`]. The reconciler asks the [`EventQueue`] who caused
//! each change; our own mirror writes are dropped there, and everything
//! else is imported into the store and announced on a broadcast channel.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use strata_types::{VfsError, VfsResult};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::events::{EventKind, EventOrigin};
use super::mirror::NativeMirror;
use crate::vfs::{now_ms, ExternalContent, Vfs};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// One notification, described in store terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeChange {
    pub kind: EventKind,
    /// Store path.
    pub path: String,
    /// Host modification time in milliseconds; 0 for directories and deletes.
    pub mtime: u64,
}

impl NativeChange {
    /// Describe `host` as it is right now.
    ///
    /// Returns `None` for locations outside the mirror root.
    pub fn observe(mirror: &NativeMirror, host: &Path, hint: EventKind) -> Option<Self> {
        let path = mirror.store_path(host)?;
        let change = match std::fs::symlink_metadata(host) {
            Ok(meta) => {
                let kind = match hint {
                    EventKind::Delete => EventKind::Update,
                    other => other,
                };
                let mtime = if meta.is_file() {
                    meta.modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map_or(0, |d| d.as_millis() as u64)
                } else {
                    0
                };
                NativeChange { kind, path, mtime }
            }
            Err(_) => NativeChange {
                kind: EventKind::Delete,
                path,
                mtime: 0,
            },
        };
        Some(change)
    }
}

/// A foreign change that was applied to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub kind: EventKind,
    pub path: String,
}

/// Applies classified native changes to a store.
pub struct Reconciler {
    vfs: Arc<Vfs>,
    mirror: NativeMirror,
    tx: broadcast::Sender<ExternalChange>,
}

impl Reconciler {
    pub fn new(vfs: Arc<Vfs>, mirror: NativeMirror) -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { vfs, mirror, tx }
    }

    pub fn mirror(&self) -> &NativeMirror {
        &self.mirror
    }

    /// Receive every external change applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.tx.subscribe()
    }

    /// Classify `change` and import it if it came from outside.
    pub fn handle(&self, change: &NativeChange) -> VfsResult<EventOrigin> {
        let origin = self
            .vfs
            .events()
            .consume(change.kind, &change.path, change.mtime);
        if origin == EventOrigin::Internal {
            tracing::trace!(path = %change.path, kind = %change.kind, "own change settled");
            return Ok(origin);
        }

        let applied = match change.kind {
            EventKind::Delete => self.vfs.remove_external(&change.path)?,
            EventKind::Create | EventKind::Update => match self.read_host(&change.path)? {
                None => self.vfs.remove_external(&change.path)?,
                Some(content) if self.already_matches(&change.path, &content) => false,
                Some(content) => {
                    let mtime = if change.mtime == 0 { now_ms() } else { change.mtime };
                    self.vfs.import_external(&change.path, content, mtime)?;
                    true
                }
            },
        };

        if applied {
            tracing::debug!(path = %change.path, kind = %change.kind, "imported external change");
            // No subscribers is fine.
            let _ = self.tx.send(ExternalChange {
                kind: change.kind,
                path: change.path.clone(),
            });
        }
        Ok(origin)
    }

    fn read_host(&self, path: &str) -> VfsResult<Option<ExternalContent>> {
        let host = self.mirror.host_path(path)?;
        let meta = match std::fs::symlink_metadata(&host) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content = if meta.is_dir() {
            ExternalContent::Directory
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&host)?;
            let target = target
                .to_str()
                .ok_or_else(|| VfsError::invalid_argument(format!("{path}: non-UTF-8 link target")))?;
            ExternalContent::Symlink(target.to_string())
        } else {
            match std::fs::read(&host) {
                Ok(bytes) => ExternalContent::File(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };
        Ok(Some(content))
    }

    fn already_matches(&self, path: &str, content: &ExternalContent) -> bool {
        let Ok(attr) = self.vfs.lstat(path) else {
            return false;
        };
        match content {
            ExternalContent::Directory => attr.kind.is_dir(),
            ExternalContent::Symlink(target) => {
                attr.kind.is_symlink() && self.vfs.readlink(path).is_ok_and(|t| &t == target)
            }
            ExternalContent::File(bytes) => {
                attr.kind.is_file() && self.vfs.read(path).is_ok_and(|b| &b == bytes)
            }
        }
    }
}

/// Watches the mirror root and feeds a [`Reconciler`].
///
/// Dropping the handle stops notifications; [`stop`](Self::stop) also ends
/// the processing task.
pub struct NativeWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl NativeWatcher {
    /// Start watching. Must be called from within a tokio runtime.
    ///
    /// `stale_sweep` is how often unmatched pending events are discarded.
    pub fn start(reconciler: Arc<Reconciler>, stale_sweep: Duration) -> VfsResult<Self> {
        let root = reconciler.mirror().root().to_path_buf();
        let (tx, mut rx) = mpsc::channel::<(std::path::PathBuf, EventKind)>(CHANGE_CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else {
                    return;
                };
                let kind = match event.kind {
                    notify::EventKind::Create(_) => EventKind::Create,
                    notify::EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => return,
                    notify::EventKind::Modify(_) => EventKind::Update,
                    notify::EventKind::Remove(_) => EventKind::Delete,
                    _ => return,
                };
                for path in event.paths {
                    if tx.try_send((path, kind)).is_err() {
                        tracing::warn!("native change channel full, notification dropped");
                    }
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(|e| VfsError::Io(io::Error::other(e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| VfsError::Io(io::Error::other(e)))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(stale_sweep.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("native watcher shutting down");
                        break;
                    }
                    _ = sweep.tick() => {
                        let events = reconciler.vfs.events().clone();
                        match tokio::task::spawn_blocking(move || events.clear_stale()).await {
                            Ok(0) => {}
                            Ok(cleared) => tracing::debug!(cleared, "discarded stale pending events"),
                            Err(e) => tracing::error!(error = %e, "stale sweep task failed"),
                        }
                    }
                    received = rx.recv() => {
                        let Some((host, hint)) = received else {
                            break;
                        };
                        let reconciler = reconciler.clone();
                        let handled = tokio::task::spawn_blocking(move || {
                            let change = NativeChange::observe(reconciler.mirror(), &host, hint)?;
                            if change.path == "/" {
                                return None;
                            }
                            let result = reconciler.handle(&change);
                            Some((change.path, result))
                        })
                        .await;
                        match handled {
                            Ok(Some((path, Err(e)))) => {
                                tracing::warn!(path = %path, error = %e, "failed to import native change");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "native change task failed"),
                        }
                    }
                }
            }
        });

        tracing::info!(path = %root.display(), "native watcher started");

        Ok(Self {
            _watcher: watcher,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, SyncConfig};
    use crate::sync::{EventQueue, MirrorTarget};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<Vfs>, Reconciler) {
        let mut config = StoreConfig::at(dir.path().join("c.bin"));
        config.index_reserve = 0;
        let events = Arc::new(EventQueue::new(Duration::ZERO, Duration::from_secs(30)));
        let target = MirrorTarget {
            root: dir.path().join("native"),
            sync: SyncConfig::default(),
        };
        let vfs = Vfs::open(&config, events, Some(target)).unwrap();
        let mirror = NativeMirror::new(dir.path().join("native")).unwrap();
        let reconciler = Reconciler::new(vfs.clone(), mirror);
        (vfs, reconciler)
    }

    #[test]
    fn test_foreign_file_is_imported_and_announced() {
        let dir = TempDir::new().unwrap();
        let (vfs, reconciler) = setup(&dir);
        let mut rx = reconciler.subscribe();

        let host = reconciler.mirror().host_path("/notes/a.txt").unwrap();
        std::fs::create_dir_all(host.parent().unwrap()).unwrap();
        std::fs::write(&host, b"from outside").unwrap();

        let change = NativeChange::observe(reconciler.mirror(), &host, EventKind::Create).unwrap();
        assert_eq!(change.path, "/notes/a.txt");
        assert!(change.mtime > 0);

        assert_eq!(reconciler.handle(&change).unwrap(), EventOrigin::External);
        assert_eq!(vfs.read("/notes/a.txt").unwrap(), b"from outside");
        assert!(vfs.lstat("/notes").unwrap().kind.is_dir());
        assert_eq!(
            rx.try_recv().unwrap(),
            ExternalChange {
                kind: EventKind::Create,
                path: "/notes/a.txt".into()
            }
        );
    }

    #[test]
    fn test_own_change_is_not_imported() {
        let dir = TempDir::new().unwrap();
        let (vfs, reconciler) = setup(&dir);
        let mut rx = reconciler.subscribe();

        vfs.write("/a.txt", b"ours").unwrap();
        let change = NativeChange {
            kind: EventKind::Create,
            path: "/a.txt".into(),
            mtime: 1,
        };
        assert_eq!(reconciler.handle(&change).unwrap(), EventOrigin::Internal);
        assert!(rx.try_recv().is_err());
        assert_eq!(vfs.events().pending_len(), 0);
    }

    #[test]
    fn test_foreign_delete_removes_from_store() {
        let dir = TempDir::new().unwrap();
        let (vfs, reconciler) = setup(&dir);
        vfs.write("/gone.txt", b"x").unwrap();
        vfs.events().reset();

        let host = reconciler.mirror().host_path("/gone.txt").unwrap();
        let change = NativeChange::observe(reconciler.mirror(), &host, EventKind::Delete).unwrap();
        assert_eq!(change.kind, EventKind::Delete);
        // reset() opened a zero-length grace window, so this counts as foreign.
        assert_eq!(reconciler.handle(&change).unwrap(), EventOrigin::External);
        assert!(!vfs.exists("/gone.txt").unwrap());
    }

    #[test]
    fn test_identical_content_is_not_reimported() {
        let dir = TempDir::new().unwrap();
        let (vfs, reconciler) = setup(&dir);
        let mut rx = reconciler.subscribe();
        vfs.write("/same.txt", b"abc").unwrap();
        vfs.events().reset();

        let host = reconciler.mirror().host_path("/same.txt").unwrap();
        std::fs::write(&host, b"abc").unwrap();
        let change = NativeChange::observe(reconciler.mirror(), &host, EventKind::Update).unwrap();
        assert_eq!(reconciler.handle(&change).unwrap(), EventOrigin::External);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_paths_outside_root_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (_vfs, reconciler) = setup(&dir);
        assert!(NativeChange::observe(reconciler.mirror(), Path::new("/etc/passwd"), EventKind::Update).is_none());
    }
}
