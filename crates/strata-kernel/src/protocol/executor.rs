//! The executing side of the arena.
//!
//! A dedicated thread waits on the arena signal with a timeout. A posted
//! REQUEST is decoded, run on the [`Backend`], and answered with a
//! RESPONSE or ERROR frame. Between requests it drains the background
//! queue and answers path-dump requests. Nothing a caller sends can stop
//! the loop: undecodable frames and failing (or panicking) operations all
//! become ERROR frames.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use strata_types::{Reply, VfsError, VfsResult, WireError};

use super::arena::{Arena, Status};
use super::codec;
use crate::backend::Backend;
use crate::config::ProtocolConfig;

/// Running executor. Dropping it stops the thread.
#[derive(Debug)]
pub struct ExecutorHandle {
    arena: Arc<Arena>,
    stop: Arc<AtomicBool>,
    served: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Frames answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.arena.signal().notify();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("executor thread panicked");
            }
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Executor {
    arena: Arc<Arena>,
    backend: Arc<dyn Backend>,
    poll: Duration,
    stop: Arc<AtomicBool>,
    served: Arc<AtomicU64>,
}

impl Executor {
    pub fn spawn(
        arena: Arc<Arena>,
        backend: Arc<dyn Backend>,
        config: &ProtocolConfig,
    ) -> std::io::Result<ExecutorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let served = Arc::new(AtomicU64::new(0));
        let executor = Executor {
            arena: arena.clone(),
            backend,
            poll: config.executor_poll().max(Duration::from_millis(1)),
            stop: stop.clone(),
            served: served.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("strata-executor".into())
            .spawn(move || executor.run())?;
        Ok(ExecutorHandle {
            arena,
            stop,
            served,
            thread: Some(thread),
        })
    }

    fn run(self) {
        tracing::debug!(backend = self.backend.name(), "executor started");
        let arena = &self.arena;
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if arena.is_status(Status::Request) {
                self.served.fetch_add(1, Ordering::Relaxed);
                self.serve();
                continue;
            }

            while let Some(op) = arena.background().try_pop() {
                let method = op.method();
                if let Err(e) = self.backend.execute(op) {
                    tracing::warn!(method, error = %e, "background op failed");
                }
                if arena.is_status(Status::Request) {
                    break;
                }
            }

            if arena.dump().take_request() {
                let text = match self.backend.list_paths() {
                    Ok(paths) => paths.join("\n"),
                    Err(e) => format!("error: {e}"),
                };
                arena.dump().publish(&text);
                arena.signal().notify();
            }

            let deadline = Instant::now() + self.poll;
            arena.signal().wait_until(Some(deadline), &|| {
                self.stop.load(Ordering::Acquire)
                    || arena.is_status(Status::Request)
                    || !arena.background().is_empty()
                    || arena.dump().is_requested()
            });
        }
        tracing::debug!("executor stopped");
    }

    fn serve(&self) {
        let op = self
            .arena
            .read_frame()
            .and_then(|(kind, frame)| codec::decode_request(kind, &frame));
        let op = match op {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable request");
                self.respond(Err(WireError::new(&e, "decode", None)));
                return;
            }
        };

        let syscall = op.method();
        let path = op.path().map(str::to_string);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.backend.execute(op)));
        let answer = match outcome {
            Ok(Ok(reply)) => self
                .encode_reply(reply, syscall, path.as_deref())
                .map_err(|e| WireError::new(&e, syscall, path)),
            Ok(Err(e)) => Err(WireError::new(&e, syscall, path)),
            Err(_) => {
                tracing::error!(syscall, "operation panicked");
                Err(WireError::new(&VfsError::other("operation panicked"), syscall, path))
            }
        };
        self.respond(answer);
    }

    /// Encode a reply, refusing one the arena cannot carry.
    fn encode_reply(&self, reply: Reply, syscall: &str, path: Option<&str>) -> VfsResult<(u8, Vec<u8>)> {
        let (kind, frame) = codec::encode_reply(reply)?;
        let capacity = self.arena.capacity();
        if frame.len() > capacity {
            tracing::warn!(syscall, ?path, len = frame.len(), capacity, "reply exceeds arena capacity");
            return Err(VfsError::invalid_argument(format!(
                "{} reply of {} bytes exceeds arena capacity {capacity}; \
                 read in ranges or raise protocol.arena_capacity",
                path.unwrap_or(syscall),
                frame.len(),
            )));
        }
        Ok((kind, frame))
    }

    fn respond(&self, answer: Result<(u8, Vec<u8>), WireError>) {
        let written = answer.and_then(|(kind, frame)| {
            self.arena
                .write_frame(kind, &frame)
                .map(|()| Status::Response)
                .map_err(|e| WireError::new(&e, "respond", None))
        });
        let status = match written {
            Ok(status) => status,
            Err(wire) => {
                if self.arena.write_frame(0, &codec::encode_error(&wire)).is_err() {
                    let short = WireError {
                        message: "error detail exceeds arena capacity".into(),
                        path: None,
                        ..wire
                    };
                    // The arena never drops below MIN_ARENA_CAPACITY, which holds this.
                    let _ = self.arena.write_frame(0, &codec::encode_error(&short));
                }
                Status::Error
            }
        };
        self.arena.set_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::SyncClient;
    use crate::protocol::wait::BlockingWait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use strata_types::{ErrorCode, Op, VfsResult};

    /// Minimal in-memory backend.
    #[derive(Default)]
    struct MapBackend {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl Backend for MapBackend {
        fn execute(&self, op: Op) -> VfsResult<Reply> {
            match op {
                Op::Write { path, data } => {
                    self.files.lock().insert(path, data);
                    Ok(Reply::Unit)
                }
                Op::Read { path } => self
                    .files
                    .lock()
                    .get(&path)
                    .cloned()
                    .map(Reply::Bytes)
                    .ok_or_else(|| VfsError::not_found(path)),
                Op::Flush => panic!("flush exploded"),
                _ => Err(VfsError::invalid_argument("unsupported")),
            }
        }

        fn list_paths(&self) -> VfsResult<Vec<String>> {
            Ok(self.files.lock().keys().cloned().collect())
        }

        fn name(&self) -> &'static str {
            "map"
        }

        fn shutdown(&self) {}
    }

    fn setup() -> (SyncClient, ExecutorHandle) {
        let config = ProtocolConfig {
            executor_poll_ms: 5,
            ..Default::default()
        };
        let arena = Arena::new(&config);
        let handle = Executor::spawn(arena.clone(), Arc::new(MapBackend::default()), &config).unwrap();
        let client = SyncClient::new(arena, Arc::new(BlockingWait), Some(Duration::from_secs(5)));
        (client, handle)
    }

    #[test]
    fn test_requests_are_served() {
        let (client, handle) = setup();
        client.call(Op::write("/a", b"1".to_vec())).unwrap();
        assert_eq!(client.call(Op::read("/a")).unwrap(), Reply::Bytes(b"1".to_vec()));
        let err = client.call(Op::read("/b")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Enoent);
        assert_eq!(err.syscall, "read");
        assert_eq!(handle.served(), 3);
    }

    #[test]
    fn test_garbage_and_panics_do_not_stop_the_loop() {
        let (client, _handle) = setup();
        let arena = client.arena().clone();

        arena.write_frame(codec::REQUEST_PLAIN, b"{garbage").unwrap();
        arena.set_status(Status::Request);
        arena
            .signal()
            .wait_until(None, &|| arena.is_status(Status::Error));
        let (_, frame) = arena.read_frame().unwrap();
        assert_eq!(codec::decode_error(&frame).unwrap().code, ErrorCode::Ebadmsg);
        arena.set_status(Status::Idle);

        let err = client.call(Op::Flush).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Eio);

        client.call(Op::write("/still", b"alive".to_vec())).unwrap();
    }

    #[test]
    fn test_reply_larger_than_arena_names_the_limit() {
        let config = ProtocolConfig {
            arena_capacity: 512,
            executor_poll_ms: 5,
            ..Default::default()
        };
        let backend = MapBackend::default();
        backend.files.lock().insert("/huge".into(), vec![b'z'; 4096]);
        let arena = Arena::new(&config);
        let _handle = Executor::spawn(arena.clone(), Arc::new(backend), &config).unwrap();
        let client = SyncClient::new(arena, Arc::new(BlockingWait), Some(Duration::from_secs(5)));

        let err = client.call(Op::read("/huge")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Einval);
        assert_eq!(err.syscall, "read");
        assert_eq!(err.path.as_deref(), Some("/huge"));
        assert!(err.to_string().contains("exceeds arena capacity 512"), "{err}");

        client.call(Op::write("/small", b"ok".to_vec())).unwrap();
        assert_eq!(client.call(Op::read("/small")).unwrap(), Reply::Bytes(b"ok".to_vec()));
    }

    #[test]
    fn test_background_posts_and_dump() {
        let (client, _handle) = setup();
        client.post(Op::write("/bg1", b"x".to_vec()));
        client.post(Op::write("/bg2", b"y".to_vec()));
        let dump = {
            let start = Instant::now();
            loop {
                let dump = client.request_path_dump(Duration::from_secs(5)).unwrap();
                if dump.lines().count() == 2 || start.elapsed() > Duration::from_secs(5) {
                    break dump;
                }
            }
        };
        assert_eq!(dump, "/bg1\n/bg2");
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        let (client, handle) = setup();
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let client = client.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let path = format!("/t{t}/{i}");
                        let body = path.clone().into_bytes();
                        client.call(Op::write(path.clone(), body.clone())).unwrap();
                        assert_eq!(client.call(Op::read(path)).unwrap(), Reply::Bytes(body));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(handle.served(), 200);
    }
}
