//! Event reconciliation.
//!
//! Every logical mutation is recorded here before it reaches native storage.
//! When the native side later reports a change, [`EventQueue::consume`]
//! decides whether we caused it (internal) or somebody else did (external).
//! Only external changes are imported back, which breaks the
//! write → notify → import → write feedback loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Kind of mutation or native notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    fn slot(self) -> usize {
        match self {
            EventKind::Create => 0,
            EventKind::Update => 1,
            EventKind::Delete => 2,
        }
    }
}

/// Who caused a native change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Internal,
    External,
}

#[derive(Debug, Default)]
struct KindCounters([AtomicU64; 3]);

impl KindCounters {
    fn bump(&self, kind: EventKind) {
        self.0[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self) -> KindCounts {
        KindCounts {
            create: self.0[0].load(Ordering::Relaxed),
            update: self.0[1].load(Ordering::Relaxed),
            delete: self.0[2].load(Ordering::Relaxed),
        }
    }
}

/// Counters shared with the arena's metrics block.
#[derive(Debug, Default)]
pub struct EventMetrics {
    queued: KindCounters,
    internal: KindCounters,
    external: KindCounters,
    self_cancelled: AtomicU64,
}

/// Per-kind counts at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl KindCounts {
    pub fn total(&self) -> u64 {
        self.create + self.update + self.delete
    }
}

/// Point-in-time copy of [`EventMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queued: KindCounts,
    pub internal: KindCounts,
    pub external: KindCounts,
    pub self_cancelled: u64,
}

impl EventMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queued: self.queued.load(),
            internal: self.internal.load(),
            external: self.external.load(),
            self_cancelled: self.self_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Outstanding mutations for one path.
#[derive(Debug, Clone, Copy)]
struct Pending {
    creates: u32,
    updates: u32,
    deletes: u32,
    last_mtime: u64,
    touched: Instant,
}

impl Pending {
    fn new() -> Self {
        Self {
            creates: 0,
            updates: 0,
            deletes: 0,
            last_mtime: 0,
            touched: Instant::now(),
        }
    }

    fn is_empty(&self) -> bool {
        self.creates == 0 && self.updates == 0 && self.deletes == 0
    }

    /// Decrement the counter for `kind`. Creates and updates stand in for
    /// each other since native APIs rarely tell them apart reliably.
    fn take(&mut self, kind: EventKind) -> bool {
        let slots: [&mut u32; 2] = match kind {
            EventKind::Delete => {
                if self.deletes > 0 {
                    self.deletes -= 1;
                    return true;
                }
                return false;
            }
            EventKind::Create => [&mut self.creates, &mut self.updates],
            EventKind::Update => [&mut self.updates, &mut self.creates],
        };
        for slot in slots {
            if *slot > 0 {
                *slot -= 1;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, Pending>,
    grace_until: Option<Instant>,
    last_sweep: Option<Instant>,
}

impl QueueState {
    /// Drop entries untouched for `stale_after`, returning how many went.
    fn sweep(&mut self, stale_after: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.touched.elapsed() < stale_after);
        self.last_sweep = Some(Instant::now());
        before - self.pending.len()
    }
}

/// Per-path pending-mutation counters.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    metrics: Arc<EventMetrics>,
    grace: Duration,
    stale_after: Duration,
}

impl EventQueue {
    pub fn new(grace: Duration, stale_after: Duration) -> Self {
        Self::with_metrics(Arc::new(EventMetrics::default()), grace, stale_after)
    }

    /// Build a queue that reports into an existing metrics block.
    pub fn with_metrics(metrics: Arc<EventMetrics>, grace: Duration, stale_after: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            metrics,
            grace,
            stale_after,
        }
    }

    pub fn metrics(&self) -> &Arc<EventMetrics> {
        &self.metrics
    }

    /// Record a logical mutation of `path` made at `mtime`.
    ///
    /// Entries nobody settles are swept here at most once per `stale_after`,
    /// so the table stays bounded even without a watcher sweeping it.
    pub fn queue(&self, kind: EventKind, path: &str, mtime: u64) {
        self.metrics.queued.bump(kind);
        let mut state = self.state.lock();
        if state.last_sweep.is_none_or(|at| at.elapsed() >= self.stale_after) {
            let swept = state.sweep(self.stale_after);
            if swept > 0 {
                tracing::debug!(swept, "cleared stale pending events");
            }
        }
        let entry = state
            .pending
            .entry(path.to_string())
            .or_insert_with(Pending::new);
        entry.touched = Instant::now();
        entry.last_mtime = entry.last_mtime.max(mtime);

        match kind {
            EventKind::Delete if entry.creates > 0 || entry.updates > 0 => {
                // The create never has to be observed natively; drop both.
                entry.creates = 0;
                entry.updates = 0;
                self.metrics.self_cancelled.fetch_add(1, Ordering::Relaxed);
                self.metrics.internal.bump(EventKind::Delete);
                if entry.is_empty() {
                    state.pending.remove(path);
                }
                tracing::trace!(path, "delete cancelled pending mutations");
            }
            EventKind::Create => entry.creates += 1,
            EventKind::Update => entry.updates += 1,
            EventKind::Delete => entry.deletes += 1,
        }
    }

    /// Classify a native notification for `path` observed at `observed_mtime`.
    ///
    /// Matches `path` and every pending descendant, so one notification for
    /// a directory settles the mutations queued beneath it.
    pub fn consume(&self, kind: EventKind, path: &str, observed_mtime: u64) -> EventOrigin {
        let mut state = self.state.lock();
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        let mut matched = false;
        let mut newest = 0u64;
        let mut emptied = Vec::new();
        for (key, entry) in state.pending.iter_mut() {
            if key != path && !key.starts_with(&prefix) {
                continue;
            }
            if entry.take(kind) {
                matched = true;
                newest = newest.max(entry.last_mtime);
            }
            if entry.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            state.pending.remove(&key);
        }

        let in_grace = state
            .grace_until
            .is_some_and(|until| Instant::now() < until);
        let origin = if matched && newest >= observed_mtime {
            EventOrigin::Internal
        } else if !matched && in_grace {
            EventOrigin::Internal
        } else {
            EventOrigin::External
        };
        drop(state);

        match origin {
            EventOrigin::Internal => self.metrics.internal.bump(kind),
            EventOrigin::External => self.metrics.external.bump(kind),
        }
        origin
    }

    /// Count a mutation that has no native side to report it back.
    pub fn count(&self, kind: EventKind) {
        self.metrics.queued.bump(kind);
    }

    /// Forget everything pending and open a grace window for in-flight notifications.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.grace_until = Some(Instant::now() + self.grace);
    }

    /// Drop entries whose native notification never arrived.
    pub fn clear_stale(&self) -> usize {
        self.state.lock().sweep(self.stale_after)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> EventQueue {
        EventQueue::new(Duration::ZERO, Duration::from_secs(30))
    }

    #[test]
    fn test_own_create_is_internal() {
        let q = queue();
        q.queue(EventKind::Create, "/a.txt", 1000);
        assert_eq!(q.consume(EventKind::Create, "/a.txt", 1000), EventOrigin::Internal);
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn test_newer_native_mtime_is_external() {
        let q = queue();
        q.queue(EventKind::Update, "/a.txt", 1000);
        assert_eq!(q.consume(EventKind::Update, "/a.txt", 2000), EventOrigin::External);
    }

    #[test]
    fn test_unmatched_is_external() {
        let q = queue();
        assert_eq!(q.consume(EventKind::Create, "/other", 0), EventOrigin::External);
        assert_eq!(q.metrics().snapshot().external.create, 1);
    }

    #[test]
    fn test_delete_cancels_pending_create() {
        let q = queue();
        q.queue(EventKind::Create, "/tmp.txt", 10);
        q.queue(EventKind::Delete, "/tmp.txt", 11);
        assert_eq!(q.pending_len(), 0);

        let snap = q.metrics().snapshot();
        assert_eq!(snap.self_cancelled, 1);
        assert_eq!(snap.internal.delete, 1);
        assert_eq!(snap.external.total(), 0);
    }

    #[test]
    fn test_directory_notification_settles_descendants() {
        let q = queue();
        q.queue(EventKind::Create, "/d/x", 5);
        q.queue(EventKind::Create, "/d/y", 6);
        q.queue(EventKind::Create, "/dx", 6);
        assert_eq!(q.consume(EventKind::Create, "/d", 6), EventOrigin::Internal);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn test_grace_window_absorbs_unmatched() {
        let q = EventQueue::new(Duration::from_secs(60), Duration::from_secs(30));
        q.queue(EventKind::Create, "/a", 1);
        q.reset();
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.consume(EventKind::Create, "/a", 1), EventOrigin::Internal);
    }

    #[test]
    fn test_queueing_sweeps_unsettled_entries() {
        let q = EventQueue::new(Duration::ZERO, Duration::from_millis(20));
        for i in 0..100 {
            q.queue(EventKind::Create, &format!("/f{i}"), 1);
        }
        assert_eq!(q.pending_len(), 100);
        std::thread::sleep(Duration::from_millis(40));
        q.queue(EventKind::Update, "/late", 2);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.metrics().snapshot().queued.total(), 101);
    }

    #[test]
    fn test_count_leaves_nothing_pending() {
        let q = queue();
        q.count(EventKind::Create);
        q.count(EventKind::Delete);
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.metrics().snapshot().queued.total(), 2);
    }

    #[test]
    fn test_clear_stale() {
        let q = EventQueue::new(Duration::ZERO, Duration::ZERO);
        q.queue(EventKind::Update, "/a", 1);
        assert_eq!(q.clear_stale(), 1);
        assert_eq!(q.pending_len(), 0);
    }
}
