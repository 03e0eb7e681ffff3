//! The calling side of the arena.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use strata_types::{CallError, Op, Reply, VfsError, VfsResult, WireError};

use super::arena::{Arena, Status};
use super::codec;
use super::wait::WaitStrategy;

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

fn next_token() -> u32 {
    loop {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        if token != 0 {
            return token;
        }
    }
}

/// Holds the arena lock word until dropped.
struct ArenaGuard<'a> {
    arena: &'a Arena,
    token: u32,
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        self.arena.unlock(self.token);
    }
}

/// Blocking calls through an [`Arena`].
///
/// Clones share the arena; concurrent calls are serialized by the arena's
/// lock word, so each one sees the frame go `IDLE → REQUEST → RESPONSE →
/// IDLE` without interleaving.
#[derive(Debug, Clone)]
pub struct SyncClient {
    arena: Arc<Arena>,
    wait: Arc<dyn WaitStrategy>,
    timeout: Option<Duration>,
}

impl SyncClient {
    /// `timeout` bounds the whole call; `None` waits forever.
    pub fn new(arena: Arc<Arena>, wait: Arc<dyn WaitStrategy>, timeout: Option<Duration>) -> Self {
        Self {
            arena,
            wait,
            timeout,
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Run `op` on the executor and wait for its answer.
    pub fn call(&self, op: Op) -> Result<Reply, CallError> {
        let syscall = op.method();
        let path = op.path().map(str::to_string);
        let fail = |e: VfsError| CallError::new(e, syscall, path.clone());
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let (kind, frame) = codec::encode_request(op).map_err(fail)?;
        let _guard = self.lock(deadline).map_err(fail)?;
        self.settle(deadline).map_err(fail)?;

        self.arena.write_frame(kind, &frame).map_err(fail)?;
        self.arena.set_status(Status::Request);

        let arena = &self.arena;
        let answered = self.wait.wait_until(arena.signal(), deadline, &|| {
            arena.is_status(Status::Response) || arena.is_status(Status::Error)
        });
        if !answered {
            // The frame stays in REQUEST; the next caller settles it.
            tracing::warn!(syscall, timeout = ?self.timeout, "call timed out");
            return Err(fail(VfsError::timeout(format!(
                "{syscall} not answered within {:?}",
                self.timeout.unwrap_or_default()
            ))));
        }

        match self.take_answer() {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(wire)) => Err(wire.into_call_error()),
            Err(e) => Err(fail(e)),
        }
    }

    /// Queue `op` for the executor's idle time without waiting.
    ///
    /// When the queue is full the oldest post is dropped.
    pub fn post(&self, op: Op) {
        if let Some(dropped) = self.arena.background().push(op) {
            tracing::warn!(method = dropped.method(), "background queue full, dropped a post");
        }
        self.arena.signal().notify();
    }

    /// Ask the executor for a listing of every stored path.
    pub fn request_path_dump(&self, timeout: Duration) -> VfsResult<String> {
        let dump = self.arena.dump();
        dump.request();
        self.arena.signal().notify();
        let deadline = Instant::now() + timeout;
        if !self
            .wait
            .wait_until(self.arena.signal(), Some(deadline), &|| dump.is_ready())
        {
            return Err(VfsError::timeout("path dump not answered"));
        }
        dump.take_response()
            .ok_or_else(|| VfsError::timeout("path dump taken by another caller"))
    }

    fn lock(&self, deadline: Option<Instant>) -> VfsResult<ArenaGuard<'_>> {
        let token = next_token();
        let mut attempt = 0;
        while !self.arena.try_lock(token) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(VfsError::timeout("arena lock not acquired"));
            }
            self.wait.backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
        Ok(ArenaGuard {
            arena: &self.arena,
            token,
        })
    }

    /// Bring the frame back to IDLE after an earlier caller gave up on it.
    fn settle(&self, deadline: Option<Instant>) -> VfsResult<()> {
        let status = match self.arena.status() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "resetting arena");
                self.arena.set_status(Status::Idle);
                return Ok(());
            }
        };
        match status {
            Status::Idle => Ok(()),
            Status::Response | Status::Error => {
                tracing::debug!(%status, "discarding stale frame");
                self.arena.set_status(Status::Idle);
                Ok(())
            }
            Status::Request => {
                let arena = &self.arena;
                if !self
                    .wait
                    .wait_until(arena.signal(), deadline, &|| !arena.is_status(Status::Request))
                {
                    return Err(VfsError::timeout("previous request still executing"));
                }
                tracing::debug!("discarding answer to abandoned request");
                self.arena.set_status(Status::Idle);
                Ok(())
            }
        }
    }

    fn take_answer(&self) -> VfsResult<Result<Reply, WireError>> {
        let status = self.arena.status();
        let frame = self.arena.read_frame();
        self.arena.set_status(Status::Idle);
        let (kind, frame) = frame?;
        match status? {
            Status::Error => Ok(Err(codec::decode_error(&frame)?)),
            _ => Ok(Ok(codec::decode_reply(kind, frame)?)),
        }
    }
}
