//! Write-behind mirroring for hybrid storage.
//!
//! Mutations are coalesced per path (latest wins), debounced, and shipped in
//! batches to a mirror worker. Write bytes are read from the store when the
//! batch is built, not when the mutation was queued, so a burst of writes
//! to one file costs one native write of the final content.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use strata_types::VfsResult;

use super::mirror::{Applied, MirrorOp, NativeMirror};
use crate::config::SyncConfig;
use crate::protocol::queue::BoundedQueue;
use crate::vfs::path;

/// A pending native-mirroring operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    Write { path: String },
    Mkdir { path: String },
    Remove { path: String },
    Symlink { path: String, target: String },
}

impl SyncOp {
    pub fn path(&self) -> &str {
        match self {
            SyncOp::Write { path }
            | SyncOp::Mkdir { path }
            | SyncOp::Remove { path }
            | SyncOp::Symlink { path, .. } => path,
        }
    }
}

/// Where write-behind reads current file bytes from.
pub trait ContentSource: Send + Sync {
    /// Current bytes and mtime of the file at `path`; `None` if it is no
    /// longer a file.
    fn content(&self, path: &str) -> VfsResult<Option<(Vec<u8>, u64)>>;
}

/// Host directory and timings for hybrid mirroring.
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub root: PathBuf,
    pub sync: SyncConfig,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    batches: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub enqueued: u64,
    pub coalesced: u64,
    pub batches: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dropped_batches: u64,
}

#[derive(Debug, Default)]
struct Pending {
    ops: IndexMap<String, SyncOp>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    flush_requested: bool,
    shutdown: bool,
}

/// Coalescing write-behind queue with a dispatcher and a mirror worker thread.
pub struct SyncQueue {
    pending: Mutex<Pending>,
    wake: Condvar,
    batches: BoundedQueue<Vec<MirrorOp>>,
    in_flight: AtomicUsize,
    metrics: SyncMetrics,
    config: SyncConfig,
    source: Weak<dyn ContentSource>,
    mirror: NativeMirror,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("root", &self.mirror.root())
            .field("pending", &self.pending.lock().ops.len())
            .finish()
    }
}

impl SyncQueue {
    /// Start the dispatcher and mirror worker.
    pub fn start(
        mirror: NativeMirror,
        config: SyncConfig,
        source: Weak<dyn ContentSource>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            batches: BoundedQueue::new(config.queue_capacity),
            in_flight: AtomicUsize::new(0),
            metrics: SyncMetrics::default(),
            config,
            source,
            mirror,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        let dispatcher = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("strata-sync-dispatch".into())
                .spawn(move || queue.dispatch_loop())
        };
        let worker = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("strata-sync-mirror".into())
                .spawn(move || queue.mirror_loop())
        };
        for spawned in [dispatcher, worker] {
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => tracing::error!(error = %e, "failed to start write-behind thread"),
            }
        }
        *queue.threads.lock() = threads;
        queue
    }

    pub fn mirror(&self) -> &NativeMirror {
        &self.mirror
    }

    /// Queue an operation; a later op on the same path replaces it.
    pub fn enqueue(&self, op: SyncOp) {
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut pending = self.pending.lock();
        if pending.shutdown {
            return;
        }
        let key = op.path().to_string();
        if pending.ops.shift_remove(&key).is_some() {
            self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(op, SyncOp::Remove { .. }) {
            // Anything queued beneath a removed directory is moot.
            let before = pending.ops.len();
            pending.ops.retain(|p, _| !path::is_descendant(p, &key));
            let dropped = (before - pending.ops.len()) as u64;
            self.metrics.coalesced.fetch_add(dropped, Ordering::Relaxed);
        }
        pending.ops.insert(key, op);
        if pending.first_at.is_none() {
            pending.first_at = Some(now);
        }
        pending.last_at = Some(now);
        drop(pending);
        self.wake.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().ops.len()
    }

    /// Dispatch everything now and wait (bounded) for the mirror to catch up.
    pub fn flush_now(&self, timeout: Duration) -> bool {
        {
            let mut pending = self.pending.lock();
            pending.flush_requested = true;
        }
        self.wake.notify_one();

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.pending.lock().ops.is_empty()
                && self.batches.is_empty()
                && self.in_flight.load(Ordering::Acquire) == 0;
            if drained {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        let m = &self.metrics;
        SyncMetricsSnapshot {
            enqueued: m.enqueued.load(Ordering::Relaxed),
            coalesced: m.coalesced.load(Ordering::Relaxed),
            batches: m.batches.load(Ordering::Relaxed),
            applied: m.applied.load(Ordering::Relaxed),
            skipped: m.skipped.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            dropped_batches: self.batches.dropped(),
        }
    }

    /// Drain what is queued, then stop both threads.
    pub fn shutdown(&self) {
        if !self.flush_now(self.config.max_delay() * 4) {
            tracing::warn!("write-behind did not drain before shutdown");
        }
        self.signal_shutdown();

        let current = std::thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// Stop accepting operations; the threads exit once what is queued is handed off.
    pub fn signal_shutdown(&self) {
        self.pending.lock().shutdown = true;
        self.wake.notify_all();
    }

    fn dispatch_loop(&self) {
        loop {
            let ops = {
                let mut pending = self.pending.lock();
                loop {
                    if pending.ops.is_empty() {
                        pending.flush_requested = false;
                        if pending.shutdown {
                            self.batches.close();
                            return;
                        }
                        self.wake.wait(&mut pending);
                        continue;
                    }
                    let now = Instant::now();
                    let quiet = pending.last_at.map(|t| t + self.config.debounce());
                    let cap = pending.first_at.map(|t| t + self.config.max_delay());
                    let due = match (quiet, cap) {
                        (Some(a), Some(b)) => a.min(b),
                        (a, b) => a.or(b).unwrap_or(now),
                    };
                    if pending.flush_requested || pending.shutdown || now >= due {
                        pending.first_at = None;
                        pending.last_at = None;
                        pending.flush_requested = false;
                        // Counted before the lock drops so flush_now never sees a gap.
                        self.in_flight.fetch_add(1, Ordering::AcqRel);
                        break std::mem::take(&mut pending.ops);
                    }
                    self.wake.wait_until(&mut pending, due);
                }
            };

            let batch = self.resolve(ops);
            self.metrics.batches.fetch_add(1, Ordering::Relaxed);
            if let Some(lost) = self.batches.push(batch) {
                tracing::warn!(ops = lost.len(), "write-behind queue full, dropped oldest batch");
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Attach current bytes to write entries.
    fn resolve(&self, ops: IndexMap<String, SyncOp>) -> Vec<MirrorOp> {
        let source = self.source.upgrade();
        let mut batch = Vec::with_capacity(ops.len());
        for (_, op) in ops {
            let entry = match op {
                SyncOp::Write { path } => {
                    let Some(source) = source.as_ref() else {
                        continue;
                    };
                    match source.content(&path) {
                        Ok(Some((bytes, mtime))) => MirrorOp::Write { path, bytes, mtime },
                        Ok(None) => continue,
                        Err(e) => {
                            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(path = %path, error = %e, "write-behind could not read content");
                            continue;
                        }
                    }
                }
                SyncOp::Mkdir { path } => MirrorOp::Mkdir { path },
                SyncOp::Remove { path } => MirrorOp::Remove { path },
                SyncOp::Symlink { path, .. } => MirrorOp::Skip {
                    path,
                    reason: "symlinks are not mirrored",
                },
            };
            batch.push(entry);
        }
        batch
    }

    fn mirror_loop(&self) {
        while let Some(batch) = self.batches.pop() {
            for op in &batch {
                match self.mirror.apply(op) {
                    Ok(Applied::Done) => {
                        self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Applied::Skipped) => {
                        self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(path = %op.path(), error = %e, "mirror write failed");
                    }
                }
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Files(Mutex<HashMap<String, Vec<u8>>>);

    impl ContentSource for Files {
        fn content(&self, path: &str) -> VfsResult<Option<(Vec<u8>, u64)>> {
            Ok(self.0.lock().get(path).cloned().map(|bytes| (bytes, 1_000)))
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            debounce_ms: 10,
            max_delay_ms: 100,
            queue_capacity: 8,
        }
    }

    fn start(dir: &TempDir, files: &Arc<Files>) -> Arc<SyncQueue> {
        let source: Weak<dyn ContentSource> = Arc::downgrade(files) as Weak<dyn ContentSource>;
        SyncQueue::start(NativeMirror::new(dir.path()).unwrap(), config(), source)
    }

    #[test]
    fn test_latest_op_wins() {
        let dir = TempDir::new().unwrap();
        let files = Arc::new(Files::default());
        let queue = start(&dir, &files);

        files.0.lock().insert("/a.txt".into(), b"final".to_vec());
        queue.enqueue(SyncOp::Write { path: "/a.txt".into() });
        queue.enqueue(SyncOp::Remove { path: "/a.txt".into() });
        queue.enqueue(SyncOp::Write { path: "/a.txt".into() });
        assert_eq!(queue.pending_len(), 1);

        assert!(queue.flush_now(Duration::from_secs(2)));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"final");

        let metrics = queue.metrics();
        assert_eq!(metrics.enqueued, 3);
        assert_eq!(metrics.coalesced, 2);
        assert_eq!(metrics.applied, 1);
        queue.shutdown();
    }

    #[test]
    fn test_bytes_read_at_dispatch_time() {
        let dir = TempDir::new().unwrap();
        let files = Arc::new(Files::default());
        let queue = start(&dir, &files);

        files.0.lock().insert("/f".into(), b"old".to_vec());
        queue.enqueue(SyncOp::Write { path: "/f".into() });
        files.0.lock().insert("/f".into(), b"new".to_vec());
        assert!(queue.flush_now(Duration::from_secs(2)));
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"new");
        queue.shutdown();
    }

    #[test]
    fn test_remove_drops_queued_descendants() {
        let dir = TempDir::new().unwrap();
        let files = Arc::new(Files::default());
        let queue = start(&dir, &files);

        queue.enqueue(SyncOp::Mkdir { path: "/d".into() });
        queue.enqueue(SyncOp::Write { path: "/d/x".into() });
        queue.enqueue(SyncOp::Remove { path: "/d".into() });
        assert_eq!(queue.pending_len(), 1);
        queue.shutdown();
    }

    #[test]
    fn test_failures_are_counted_not_retried() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"file").unwrap();
        let files = Arc::new(Files::default());
        let queue = start(&dir, &files);

        files.0.lock().insert("/blocker/inner".into(), b"x".to_vec());
        queue.enqueue(SyncOp::Write { path: "/blocker/inner".into() });
        queue.enqueue(SyncOp::Symlink {
            path: "/l".into(),
            target: "/x".into(),
        });
        assert!(queue.flush_now(Duration::from_secs(2)));

        let metrics = queue.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.applied, 0);
        queue.shutdown();
    }
}
