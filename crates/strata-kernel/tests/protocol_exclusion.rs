//! Two independent callers sharing one arena never see each other's frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use strata_kernel::backend::Backend;
use strata_kernel::config::{ProtocolConfig, StoreConfig, WaitMode};
use strata_kernel::protocol::{Arena, Executor, SyncClient, wait};
use strata_kernel::sync::EventQueue;
use strata_kernel::vfs::Vfs;
use strata_types::{Op, Reply, VfsResult};
use tempfile::TempDir;

/// Wraps a backend and fails the test if two operations ever overlap.
struct Exclusive {
    inner: Arc<Vfs>,
    busy: AtomicBool,
    overlaps: AtomicUsize,
}

impl Backend for Exclusive {
    fn execute(&self, op: Op) -> VfsResult<Reply> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_micros(200));
        let reply = self.inner.execute(op);
        self.busy.store(false, Ordering::SeqCst);
        reply
    }

    fn list_paths(&self) -> VfsResult<Vec<String>> {
        self.inner.list_paths()
    }

    fn name(&self) -> &'static str {
        "exclusive"
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn run_callers(mode: WaitMode) {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(EventQueue::new(Duration::ZERO, Duration::from_secs(30)));
    let vfs = Vfs::open(&StoreConfig::at(dir.path().join("c.bin")), events, None).unwrap();
    let backend = Arc::new(Exclusive {
        inner: vfs,
        busy: AtomicBool::new(false),
        overlaps: AtomicUsize::new(0),
    });

    let config = ProtocolConfig {
        wait: mode,
        executor_poll_ms: 5,
        ..Default::default()
    };
    let arena = Arena::new(&config);
    let executor = Executor::spawn(arena.clone(), backend.clone(), &config).unwrap();

    // The external caller and the owning context's own call path.
    let callers: Vec<_> = ["external", "privileged"]
        .into_iter()
        .map(|name| {
            let client = SyncClient::new(arena.clone(), wait::strategy(mode), Some(Duration::from_secs(10)));
            std::thread::spawn(move || {
                for i in 0..40 {
                    let path = format!("/{name}-{i}");
                    let body = format!("{name}:{i}:").repeat(i + 1).into_bytes();
                    client.call(Op::write(path.clone(), body.clone())).unwrap();
                    let reply = client.call(Op::read(path)).unwrap();
                    assert_eq!(reply, Reply::Bytes(body), "{name} got a frame that was not its own");
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    assert_eq!(executor.served(), 160);
    assert_eq!(backend.overlaps.load(Ordering::SeqCst), 0);
    assert!(!arena.is_locked());
}

#[test]
fn test_blocking_callers_are_serialized() {
    run_callers(WaitMode::Blocking);
}

#[test]
fn test_spinning_callers_are_serialized() {
    run_callers(WaitMode::Spin);
}
