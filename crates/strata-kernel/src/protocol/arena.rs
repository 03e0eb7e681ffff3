//! The shared request/response arena.
//!
//! One frame at a time moves through the arena:
//!
//! ```text
//! IDLE ──caller──▶ REQUEST ──executor──▶ RESPONSE | ERROR ──caller──▶ IDLE
//! ```
//!
//! Besides the frame the arena carries a lock word (callers take it before
//! touching the frame), the event metrics block, a diagnostic dump slot,
//! and the fire-and-forget background queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use strata_types::{Op, VfsError, VfsResult};

use super::queue::BoundedQueue;
use crate::config::{MIN_ARENA_CAPACITY, ProtocolConfig};
use crate::sync::EventMetrics;

/// Frame state, stored in the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum Status {
    Idle = 0,
    Request = 1,
    Response = 2,
    Error = 3,
}

impl Status {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Status::Idle),
            1 => Some(Status::Request),
            2 => Some(Status::Response),
            3 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Wake-up primitive shared by both sides of the arena.
///
/// Every notification bumps a sequence number under the mutex, so a waiter
/// that checked its condition before sleeping cannot miss it.
#[derive(Debug, Default)]
pub struct Signal {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub fn notify(&self) {
        *self.seq.lock() += 1;
        self.cond.notify_all();
    }

    /// Block until `ready()` holds or `deadline` passes. Returns `ready()`.
    pub fn wait_until(&self, deadline: Option<Instant>, ready: &dyn Fn() -> bool) -> bool {
        let mut seq = self.seq.lock();
        loop {
            if ready() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut seq, deadline).timed_out() {
                        return ready();
                    }
                }
                None => self.cond.wait(&mut seq),
            }
        }
    }
}

/// Request/response flags plus a bounded text buffer for path listings.
#[derive(Debug)]
pub struct DumpSlot {
    requested: AtomicBool,
    ready: AtomicBool,
    text: Mutex<String>,
    limit: usize,
}

impl DumpSlot {
    fn new(limit: usize) -> Self {
        Self {
            requested: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            text: Mutex::new(String::new()),
            limit,
        }
    }

    pub fn request(&self) {
        self.ready.store(false, Ordering::Release);
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Claim a pending request.
    pub fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    /// Store `text`, cut to the slot limit on a character boundary.
    pub fn publish(&self, text: &str) {
        let mut end = text.len().min(self.limit);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        *self.text.lock() = text[..end].to_string();
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn take_response(&self) -> Option<String> {
        if self.ready.swap(false, Ordering::AcqRel) {
            Some(std::mem::take(&mut *self.text.lock()))
        } else {
            None
        }
    }
}

/// The arena itself.
#[derive(Debug)]
pub struct Arena {
    status: AtomicI32,
    len: AtomicU32,
    kind: AtomicU8,
    lock: AtomicU32,
    payload: Mutex<Box<[u8]>>,
    signal: Signal,
    metrics: Arc<EventMetrics>,
    dump: DumpSlot,
    background: BoundedQueue<Op>,
}

impl Arena {
    pub fn new(config: &ProtocolConfig) -> Arc<Self> {
        Self::with_metrics(config, Arc::new(EventMetrics::default()))
    }

    pub fn with_metrics(config: &ProtocolConfig, metrics: Arc<EventMetrics>) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicI32::new(Status::Idle as i32),
            len: AtomicU32::new(0),
            kind: AtomicU8::new(0),
            lock: AtomicU32::new(0),
            payload: Mutex::new(
                vec![0u8; config.arena_capacity.max(MIN_ARENA_CAPACITY)].into_boxed_slice(),
            ),
            signal: Signal::default(),
            metrics,
            dump: DumpSlot::new(config.dump_limit),
            background: BoundedQueue::new(config.background_capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.payload.lock().len()
    }

    /// Current status. An unknown raw value reads as corruption.
    pub fn status(&self) -> VfsResult<Status> {
        let raw = self.status.load(Ordering::Acquire);
        Status::from_raw(raw).ok_or_else(|| VfsError::corruption(format!("arena status word {raw}")))
    }

    /// Set the status and wake the other side.
    pub fn set_status(&self, status: Status) {
        self.status.store(status as i32, Ordering::Release);
        self.signal.notify();
    }

    pub fn is_status(&self, status: Status) -> bool {
        self.status.load(Ordering::Acquire) == status as i32
    }

    /// Copy a frame into the payload region.
    pub fn write_frame(&self, kind: u8, bytes: &[u8]) -> VfsResult<()> {
        let mut payload = self.payload.lock();
        if bytes.len() > payload.len() {
            return Err(VfsError::invalid_argument(format!(
                "frame of {} bytes exceeds arena capacity {}",
                bytes.len(),
                payload.len()
            )));
        }
        payload[..bytes.len()].copy_from_slice(bytes);
        self.kind.store(kind, Ordering::Release);
        self.len.store(bytes.len() as u32, Ordering::Release);
        Ok(())
    }

    /// Copy the current frame out. A length beyond capacity is corruption.
    pub fn read_frame(&self) -> VfsResult<(u8, Vec<u8>)> {
        let payload = self.payload.lock();
        let len = self.len.load(Ordering::Acquire) as usize;
        if len > payload.len() {
            return Err(VfsError::corruption(format!(
                "frame length {len} exceeds arena capacity {}",
                payload.len()
            )));
        }
        Ok((self.kind.load(Ordering::Acquire), payload[..len].to_vec()))
    }

    /// Overwrite the length word directly.
    #[cfg(test)]
    pub(crate) fn poison_len(&self, len: u32) {
        self.len.store(len, Ordering::Release);
    }

    /// Take the lock word for `token` (non-zero) if it is free.
    pub fn try_lock(&self, token: u32) -> bool {
        self.lock
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self, token: u32) {
        if self
            .lock
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.signal.notify();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire) != 0
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn metrics(&self) -> &Arc<EventMetrics> {
        &self.metrics
    }

    pub fn dump(&self) -> &DumpSlot {
        &self.dump
    }

    pub fn background(&self) -> &BoundedQueue<Op> {
        &self.background
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small() -> ProtocolConfig {
        ProtocolConfig {
            arena_capacity: MIN_ARENA_CAPACITY,
            dump_limit: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_bounds() {
        let arena = Arena::new(&small());
        arena.write_frame(1, b"hello").unwrap();
        assert_eq!(arena.read_frame().unwrap(), (1, b"hello".to_vec()));

        assert!(arena.write_frame(0, &[0u8; MIN_ARENA_CAPACITY + 1]).is_err());

        arena.poison_len(1000);
        let err = arena.read_frame().unwrap_err();
        assert!(matches!(err, VfsError::Corruption(_)));
    }

    #[test]
    fn test_tiny_capacity_is_raised_to_the_minimum() {
        let arena = Arena::new(&ProtocolConfig {
            arena_capacity: 16,
            ..Default::default()
        });
        assert_eq!(arena.capacity(), MIN_ARENA_CAPACITY);
        arena.write_frame(0, &[7u8; 64]).unwrap();
        assert_eq!(arena.read_frame().unwrap().1.len(), 64);
    }

    #[test]
    fn test_lock_word() {
        let arena = Arena::new(&small());
        assert!(arena.try_lock(7));
        assert!(!arena.try_lock(8));
        arena.unlock(8);
        assert!(arena.is_locked());
        arena.unlock(7);
        assert!(arena.try_lock(8));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let arena = Arena::new(&small());
        let waiter = {
            let arena = arena.clone();
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                arena
                    .signal()
                    .wait_until(Some(deadline), &|| arena.is_status(Status::Response))
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        arena.set_status(Status::Response);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_dump_slot_truncates_on_char_boundary() {
        let arena = Arena::new(&small());
        arena.dump().request();
        assert!(arena.dump().take_request());
        assert!(!arena.dump().take_request());
        arena.dump().publish("/a\n/ü/long-name");
        assert_eq!(arena.dump().take_response().as_deref(), Some("/a\n/ü/l"));
        assert_eq!(arena.dump().take_response(), None);
    }
}
