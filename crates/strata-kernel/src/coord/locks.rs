//! Origin-scoped advisory locks.
//!
//! Every named lock is a one-permit semaphore. Holding the returned
//! [`LockGuard`] holds the lock; dropping it (including when the holding
//! task dies) releases it. Waiting on somebody else's lock is therefore a
//! way to learn that they are gone.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held lock.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockManager {
    locks: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Wait until `name` is free and take it.
    pub async fn acquire(&self, name: &str) -> LockGuard {
        let permit = loop {
            // Semaphores are never closed, so this only loops if one was.
            if let Ok(permit) = self.semaphore(name).acquire_owned().await {
                break permit;
            }
            self.locks.remove(name);
        };
        LockGuard {
            name: name.to_string(),
            _permit: permit,
        }
    }

    /// Take `name` if nobody holds it.
    pub fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        let permit = self.semaphore(name).try_acquire_owned().ok()?;
        Some(LockGuard {
            name: name.to_string(),
            _permit: permit,
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|s| s.available_permits() == 0)
    }
}
