//! Per-node specialization lock.
//!
//! Slow-path specialization, rewrites and resets of one node are serialized
//! by a [`SpecializationLock`]. The lock remembers its owning thread, so a
//! re-entrant acquisition (a guard or cache initializer dispatching through
//! the node it is specializing) is reported instead of deadlocking.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Token source; 0 means "no owner".
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn current_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// A mutex that detects same-thread re-entry.
#[derive(Debug, Default)]
pub struct SpecializationLock {
    mutex: Mutex<()>,
    owner: AtomicU64,
}

impl SpecializationLock {
    /// Unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking on other threads.
    ///
    /// Returns `None` if the current thread already holds it.
    pub fn try_acquire(&self) -> Option<SpecializationGuard<'_>> {
        let token = current_token();
        if self.owner.load(Ordering::Acquire) == token {
            return None;
        }
        let guard = self.mutex.lock();
        self.owner.store(token, Ordering::Release);
        Some(SpecializationGuard {
            lock: self,
            _guard: guard,
        })
    }

    /// Whether the current thread holds the lock.
    pub fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_token()
    }

    /// Whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }
}

/// Holds a [`SpecializationLock`] until dropped.
#[must_use = "the lock is released when the guard is dropped"]
pub struct SpecializationGuard<'a> {
    lock: &'a SpecializationLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for SpecializationGuard<'_> {
    fn drop(&mut self) {
        // Cleared before the mutex guard field is dropped.
        self.lock.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentry_detected() {
        let lock = SpecializationLock::new();
        let guard = lock.try_acquire();
        assert!(guard.is_some());
        assert!(lock.held_by_current_thread());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(!lock.held_by_current_thread());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_other_thread_blocks_then_acquires() {
        let lock = Arc::new(SpecializationLock::new());
        let guard = lock.try_acquire();
        let other = lock.clone();
        let handle = std::thread::spawn(move || other.try_acquire().is_some());
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        assert!(handle.join().unwrap());
        assert!(!lock.is_locked());
    }
}
