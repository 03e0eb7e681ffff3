//! Size-bounded hand-off queue.
//!
//! Producers never block: when the queue is full the oldest entry is
//! dropped and counted. Used for fire-and-forget posts to the executor and
//! for write-behind batches on their way to the mirror worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Slots<T> {
    items: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    slots: Mutex<Slots<T>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, returning the entry evicted to make room, if any.
    ///
    /// After [`close`](Self::close) the item is handed straight back.
    pub fn push(&self, item: T) -> Option<T> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Some(item);
        }
        let evicted = if slots.items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            slots.items.pop_front()
        } else {
            None
        };
        slots.items.push_back(item);
        drop(slots);
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.slots.lock().items.pop_front()
    }

    /// Wait up to `timeout` for an entry.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            if let Some(item) = slots.items.pop_front() {
                return Some(item);
            }
            if slots.closed || self.ready.wait_until(&mut slots, deadline).timed_out() {
                return slots.items.pop_front();
            }
        }
    }

    /// Wait for an entry; `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut slots = self.slots.lock();
        loop {
            if let Some(item) = slots.items.pop_front() {
                return Some(item);
            }
            if slots.closed {
                return None;
            }
            self.ready.wait(&mut slots);
        }
    }

    /// Stop accepting entries and wake every waiter.
    pub fn close(&self) {
        self.slots.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overflow_drops_oldest() {
        let q = BoundedQueue::new(2);
        assert_eq!(q.push(1), None);
        assert_eq!(q.push(2), None);
        assert_eq!(q.push(3), Some(1));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_pop_wakes_on_push_and_close() {
        let q = Arc::new(BoundedQueue::new(4));
        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(v) = q.pop() {
                    seen.push(v);
                }
                seen
            })
        };
        q.push("a");
        q.push("b");
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), vec!["a", "b"]);
        assert_eq!(q.push("late"), Some("late"));
    }

    #[test]
    fn test_pop_timeout_expires() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), None);
    }
}
