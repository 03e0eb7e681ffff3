//! How callers wait on the arena.
//!
//! [`BlockingWait`] parks the thread on the arena's [`Signal`].
//! [`SpinWait`] never parks: it polls the condition and yields to the
//! scheduler every few hundred iterations. It exists for callers that must
//! not block (a UI or event-loop thread); everything else should block.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::arena::Signal;
use crate::config::WaitMode;

const SPINS_PER_YIELD: u32 = 256;

pub trait WaitStrategy: Send + Sync + std::fmt::Debug {
    /// Wait until `ready()` or `deadline`. Returns `ready()`.
    fn wait_until(&self, signal: &Signal, deadline: Option<Instant>, ready: &dyn Fn() -> bool) -> bool;

    /// Pause between attempts to take the arena lock.
    fn backoff(&self, attempt: u32);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingWait;

impl WaitStrategy for BlockingWait {
    fn wait_until(&self, signal: &Signal, deadline: Option<Instant>, ready: &dyn Fn() -> bool) -> bool {
        signal.wait_until(deadline, ready)
    }

    fn backoff(&self, attempt: u32) {
        std::thread::sleep(Duration::from_micros(50 << attempt.min(6)));
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpinWait;

impl WaitStrategy for SpinWait {
    fn wait_until(&self, _signal: &Signal, deadline: Option<Instant>, ready: &dyn Fn() -> bool) -> bool {
        let mut spins = 0u32;
        loop {
            if ready() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return ready();
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn backoff(&self, attempt: u32) {
        for _ in 0..(1u32 << attempt.min(10)) {
            std::hint::spin_loop();
        }
        std::thread::yield_now();
    }

    fn name(&self) -> &'static str {
        "spin"
    }
}

pub fn strategy(mode: WaitMode) -> Arc<dyn WaitStrategy> {
    match mode {
        WaitMode::Blocking => Arc::new(BlockingWait),
        WaitMode::Spin => Arc::new(SpinWait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flips_after(strategy: Arc<dyn WaitStrategy>) {
        let signal = Arc::new(Signal::default());
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let (signal, flag) = (signal.clone(), flag.clone());
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
                signal.notify();
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(strategy.wait_until(&signal, Some(deadline), &|| flag.load(Ordering::SeqCst)));
        setter.join().unwrap();
    }

    #[test]
    fn test_both_strategies_observe_the_flag() {
        flips_after(strategy(WaitMode::Blocking));
        flips_after(strategy(WaitMode::Spin));
    }

    #[test]
    fn test_deadline_expires() {
        let signal = Signal::default();
        for mode in [WaitMode::Blocking, WaitMode::Spin] {
            let deadline = Instant::now() + Duration::from_millis(5);
            assert!(!strategy(mode).wait_until(&signal, Some(deadline), &|| false));
        }
    }
}
