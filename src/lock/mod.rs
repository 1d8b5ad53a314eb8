//! Mutual exclusion for the pipeline's shared state.
//!
//! The allocator, the queues and the job counter carry no synchronization of
//! their own. They are paired with a lock in a [`Guarded`], and every lock
//! kind implements [`RawLock`] so the pairing is independent of the lock.

pub mod queue;
pub mod spin;

use core::fmt;

use tracing::warn;

use crate::config::LockKind;
use crate::sync::UnsafeCell;

pub use queue::{QueueLock, WaitHandle, WaitRegistry};
pub use spin::{SpinGuard, SpinLock};

/// Lock interface keyed by worker id.
///
/// Worker-oblivious locks ignore the id; [`QueueLock`] uses it to find the
/// caller's binding slot on release.
pub trait RawLock: Send + Sync {
    /// Spin until `worker` holds the lock.
    fn lock(&self, worker: usize);
    /// Take the lock without waiting.
    fn try_lock(&self, worker: usize) -> bool;
    /// Release the hold of `worker`.
    fn unlock(&self, worker: usize);
}

impl RawLock for SpinLock {
    #[inline]
    fn lock(&self, _worker: usize) {
        self.acquire_raw();
    }

    #[inline]
    fn try_lock(&self, _worker: usize) -> bool {
        self.try_acquire_raw()
    }

    #[inline]
    fn unlock(&self, _worker: usize) {
        self.release_raw();
    }
}

impl RawLock for QueueLock {
    #[inline]
    fn lock(&self, worker: usize) {
        self.acquire_raw(worker);
    }

    #[inline]
    fn try_lock(&self, worker: usize) -> bool {
        self.try_acquire_raw(worker)
    }

    #[inline]
    fn unlock(&self, worker: usize) {
        self.release_raw(worker);
    }
}

/// Either lock kind, picked at runtime from [`LockKind`].
#[derive(Debug)]
pub enum AnyLock {
    /// Fair MCS lock.
    Queue(QueueLock),
    /// Test-and-set lock.
    Spin(SpinLock),
}

impl AnyLock {
    /// Build a lock of `kind`. Queue locks draw wait nodes from `registry`;
    /// spinlocks reuse its backoff.
    pub fn new(kind: LockKind, registry: &std::sync::Arc<WaitRegistry>) -> Self {
        match kind {
            LockKind::Queue => AnyLock::Queue(QueueLock::new(registry)),
            LockKind::Spin => AnyLock::Spin(SpinLock::with_backoff(registry.backoff())),
        }
    }

    /// Kind of the wrapped lock.
    pub fn kind(&self) -> LockKind {
        match self {
            AnyLock::Queue(_) => LockKind::Queue,
            AnyLock::Spin(_) => LockKind::Spin,
        }
    }
}

impl RawLock for AnyLock {
    #[inline]
    fn lock(&self, worker: usize) {
        match self {
            AnyLock::Queue(l) => RawLock::lock(l, worker),
            AnyLock::Spin(l) => RawLock::lock(l, worker),
        }
    }

    #[inline]
    fn try_lock(&self, worker: usize) -> bool {
        match self {
            AnyLock::Queue(l) => l.try_lock(worker),
            AnyLock::Spin(l) => l.try_lock(worker),
        }
    }

    #[inline]
    fn unlock(&self, worker: usize) {
        match self {
            AnyLock::Queue(l) => l.unlock(worker),
            AnyLock::Spin(l) => l.unlock(worker),
        }
    }
}

/// State that may only be touched while `lock` is held.
pub struct Guarded<L, T> {
    lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through `with`/`try_with`, which hold `lock`
// for the whole access, so at most one thread sees `&mut T` at a time.
unsafe impl<L: RawLock, T: Send> Send for Guarded<L, T> {}
unsafe impl<L: RawLock, T: Send> Sync for Guarded<L, T> {}

impl<L: RawLock, T> Guarded<L, T> {
    /// Pair `data` with `lock`.
    pub fn new(lock: L, data: T) -> Self {
        Guarded {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// The guarding lock.
    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Run `f` on the data with the lock held by `worker`.
    ///
    /// The lock is released when `f` returns or unwinds.
    pub fn with<R>(&self, worker: usize, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.lock(worker);
        let _unlock = Unlock {
            lock: &self.lock,
            worker,
        };
        // SAFETY: the lock is held until `_unlock` drops.
        self.data.with_mut(|ptr| f(unsafe { &mut *ptr }))
    }

    /// Like [`Guarded::with`], but gives up instead of waiting for the lock.
    pub fn try_with<R>(&self, worker: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if !self.lock.try_lock(worker) {
            return None;
        }
        let _unlock = Unlock {
            lock: &self.lock,
            worker,
        };
        // SAFETY: the lock is held until `_unlock` drops.
        Some(self.data.with_mut(|ptr| f(unsafe { &mut *ptr })))
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` rules out any concurrent `with`.
        self.data.with_mut(|ptr| unsafe { &mut *ptr })
    }
}

impl<L: fmt::Debug, T> fmt::Debug for Guarded<L, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

struct Unlock<'a, L: RawLock> {
    lock: &'a L,
    worker: usize,
}

impl<L: RawLock> Drop for Unlock<'_, L> {
    fn drop(&mut self) {
        self.lock.unlock(self.worker);
    }
}

/// Policy for releasing a lock the caller does not hold: fatal with debug
/// assertions, a logged no-op otherwise.
#[track_caller]
pub(crate) fn release_not_held(kind: &'static str, worker: Option<usize>) {
    if cfg!(debug_assertions) {
        panic!("release of a {kind} not held by the caller (worker {worker:?})");
    }
    warn!(kind, ?worker, "release of a lock not held by the caller ignored");
}
