//! Background index flushing and scheduled compaction.
//!
//! One thread per store. Mutations only record *when* work becomes due;
//! the thread sleeps on a condvar until the earliest deadline, then calls
//! back into the store through a [`Weak`] reference so it never keeps a
//! closed store alive.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_types::VfsResult;

use super::compactor::CompactionPolicy;

/// Work the maintenance thread performs on a store.
pub trait Maintained: Send + Sync + 'static {
    /// Write the index if it is dirty.
    fn flush_index(&self) -> VfsResult<()>;
    /// Run a compaction that was scheduled earlier.
    fn compact_scheduled(&self) -> VfsResult<()>;
}

#[derive(Debug)]
struct Schedule {
    flush_at: Option<Instant>,
    compact_due: Option<Instant>,
    compact_deadline: Option<Instant>,
    last_activity: Instant,
    shutdown: bool,
}

/// Shared schedule between a store and its maintenance thread.
#[derive(Debug)]
pub struct Maintenance {
    schedule: Mutex<Schedule>,
    wake: Condvar,
    policy: CompactionPolicy,
}

enum Due {
    Work { flush: bool, compact: bool },
    Sleep(Option<Instant>),
    Exit,
}

impl Maintenance {
    pub fn new(policy: CompactionPolicy) -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(Schedule {
                flush_at: None,
                compact_due: None,
                compact_deadline: None,
                last_activity: Instant::now(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            policy,
        })
    }

    /// Record store activity; compaction waits for a quiet period.
    pub fn touch(&self) {
        self.schedule.lock().last_activity = Instant::now();
    }

    /// Ask for a flush `debounce` from now. Later requests fold into it.
    pub fn request_flush(&self, debounce: Duration) {
        let mut schedule = self.schedule.lock();
        if schedule.flush_at.is_none() {
            schedule.flush_at = Some(Instant::now() + debounce);
            self.wake.notify_one();
        }
    }

    /// Schedule a compaction, restarting its debounce.
    pub fn request_compaction(&self) {
        let now = Instant::now();
        let mut schedule = self.schedule.lock();
        let due = now + self.policy.debounce;
        schedule.compact_due = Some(due);
        if schedule.compact_deadline.is_none() {
            schedule.compact_deadline = Some(due + self.policy.idle_timeout);
        }
        self.wake.notify_one();
    }

    /// Forget a pending compaction (one just ran).
    pub fn cancel_compaction(&self) {
        let mut schedule = self.schedule.lock();
        schedule.compact_due = None;
        schedule.compact_deadline = None;
    }

    pub fn compaction_pending(&self) -> bool {
        self.schedule.lock().compact_due.is_some()
    }

    pub fn shutdown(&self) {
        self.schedule.lock().shutdown = true;
        self.wake.notify_all();
    }

    fn next(&self, schedule: &mut Schedule, now: Instant) -> Due {
        if schedule.shutdown {
            return Due::Exit;
        }

        let flush = schedule.flush_at.is_some_and(|at| now >= at);
        if flush {
            schedule.flush_at = None;
        }

        let mut compact_wake = None;
        if let Some(due) = schedule.compact_due {
            if now < due {
                compact_wake = Some(due);
            } else {
                let idle_at = schedule.last_activity + self.policy.idle_window;
                let deadline = schedule.compact_deadline.unwrap_or(now);
                if now >= idle_at || now >= deadline {
                    schedule.compact_due = None;
                    schedule.compact_deadline = None;
                    return Due::Work {
                        flush,
                        compact: true,
                    };
                }
                compact_wake = Some(idle_at.min(deadline));
            }
        }

        if flush {
            return Due::Work {
                flush,
                compact: false,
            };
        }
        let wake = match (schedule.flush_at, compact_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Due::Sleep(wake)
    }
}

/// Start the maintenance thread for `target`.
pub fn spawn<T: Maintained>(
    maintenance: Arc<Maintenance>,
    target: Weak<T>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("strata-maintenance".into())
        .spawn(move || run(maintenance, target))
}

fn run<T: Maintained>(maintenance: Arc<Maintenance>, target: Weak<T>) {
    loop {
        let (flush, compact) = {
            let mut schedule = maintenance.schedule.lock();
            match maintenance.next(&mut schedule, Instant::now()) {
                Due::Exit => break,
                Due::Work { flush, compact } => (flush, compact),
                Due::Sleep(Some(at)) => {
                    maintenance.wake.wait_until(&mut schedule, at);
                    continue;
                }
                Due::Sleep(None) => {
                    maintenance.wake.wait(&mut schedule);
                    continue;
                }
            }
        };

        let Some(store) = target.upgrade() else {
            break;
        };
        if compact {
            if let Err(e) = store.compact_scheduled() {
                tracing::error!(error = %e, "scheduled compaction failed");
            }
        }
        if flush {
            if let Err(e) = store.flush_index() {
                tracing::error!(error = %e, "index flush failed");
            }
        }
    }
    tracing::debug!("maintenance thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        flushes: AtomicUsize,
        compactions: AtomicUsize,
    }

    impl Maintained for Counting {
        fn flush_index(&self) -> VfsResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn compact_scheduled(&self) -> VfsResult<()> {
            self.compactions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn policy() -> CompactionPolicy {
        CompactionPolicy {
            debounce: Duration::from_millis(20),
            idle_window: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_flush_requests_coalesce() {
        let target = Arc::new(Counting::default());
        let maintenance = Maintenance::new(policy());
        let handle = spawn(maintenance.clone(), Arc::downgrade(&target)).unwrap();

        for _ in 0..10 {
            maintenance.request_flush(Duration::from_millis(30));
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);

        maintenance.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_compaction_waits_for_idle_then_runs_once() {
        let target = Arc::new(Counting::default());
        let maintenance = Maintenance::new(policy());
        let handle = spawn(maintenance.clone(), Arc::downgrade(&target)).unwrap();

        maintenance.request_compaction();
        maintenance.request_compaction();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(target.compactions.load(Ordering::SeqCst), 1);
        assert!(!maintenance.compaction_pending());

        maintenance.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_fallback_when_never_idle() {
        let target = Arc::new(Counting::default());
        let maintenance = Maintenance::new(policy());
        let handle = spawn(maintenance.clone(), Arc::downgrade(&target)).unwrap();

        maintenance.request_compaction();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(400)
            && target.compactions.load(Ordering::SeqCst) == 0
        {
            maintenance.touch();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(target.compactions.load(Ordering::SeqCst), 1);

        maintenance.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_exits_when_target_dropped() {
        let target = Arc::new(Counting::default());
        let maintenance = Maintenance::new(policy());
        let handle = spawn(maintenance.clone(), Arc::downgrade(&target)).unwrap();
        drop(target);
        maintenance.request_flush(Duration::ZERO);
        handle.join().unwrap();
    }
}
