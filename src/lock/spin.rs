//! Test-and-set spinlock.

use core::fmt;

use tracing::trace;

use crate::backoff::Backoff;
use crate::sync::{AtomicBool, Ordering};
use crate::CachePadded;

/// Baseline test-and-set lock.
///
/// No fairness and no bounded waiting: whichever worker wins the swap after a
/// release gets the lock. Cheaper than [`crate::QueueLock`] for very short
/// critical sections with little contention.
pub struct SpinLock {
    locked: CachePadded<AtomicBool>,
    backoff: Backoff,
}

impl SpinLock {
    /// Unlocked spinlock spinning with the default [`Backoff`].
    pub fn new() -> Self {
        Self::with_backoff(Backoff::default())
    }

    /// Unlocked spinlock that snoozes with `backoff` between failed attempts.
    pub fn with_backoff(backoff: Backoff) -> Self {
        SpinLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            backoff,
        }
    }

    /// Spin until the lock is taken.
    pub fn acquire(&self) -> SpinGuard<'_> {
        self.acquire_raw();
        SpinGuard { lock: self }
    }

    /// Take the lock if it is free. Never spins.
    pub fn try_acquire(&self) -> Option<SpinGuard<'_>> {
        self.try_acquire_raw().then_some(SpinGuard { lock: self })
    }

    /// Guard-less acquire; pair with [`SpinLock::release_raw`].
    pub fn acquire_raw(&self) {
        let mut step = 0u32;
        while self.locked.value.swap(true, Ordering::Acquire) {
            step = self.backoff.snooze(step);
        }
        if step > 0 {
            trace!(snoozes = step, "spinlock acquired after contention");
        }
    }

    /// Guard-less try-acquire.
    pub fn try_acquire_raw(&self) -> bool {
        !self.locked.value.swap(true, Ordering::Acquire)
    }

    /// Store-release of the lock word.
    ///
    /// Releasing an unlocked spinlock is a no-op, but panics with debug
    /// assertions enabled.
    pub fn release_raw(&self) {
        let was_locked = self.locked.value.swap(false, Ordering::Release);
        if !was_locked {
            super::release_not_held("spinlock", None);
        }
    }

    /// Whether some worker currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.value.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Held [`SpinLock`]; releases on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_raw();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = SpinLock::new();
        let guard = lock.acquire();
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "not held"))]
    fn release_unlocked_is_noop_in_release() {
        let lock = SpinLock::new();
        lock.release_raw();
        assert!(!lock.is_locked());
    }

    #[test]
    fn excludes_concurrent_holders() {
        let lock = Arc::new(SpinLock::with_backoff(Backoff::Delay { iterations: 4 }));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let _g = lock.acquire();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
