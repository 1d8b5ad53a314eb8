//! MCS queue lock with per-worker binding tables.
//!
//! Each waiter spins on a flag inside its own wait node, so a release touches
//! exactly one remote cache line (the successor's flag). Wait nodes are not
//! allocated per acquire: every worker owns a fixed row of binding slots in a
//! shared [`WaitRegistry`], and an acquire borrows a free slot from the
//! caller's row for as long as it is queued on, or holding, the lock.
//!
//! Nodes are named by integer tokens instead of addresses. A token is the
//! flat slot index plus one, so `0` doubles as the null link.

use core::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::backoff::Backoff;
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::CachePadded;

const NIL: usize = 0;
const UNBOUND: usize = 0;

struct Binding {
    /// Id of the lock this slot is bound to, [`UNBOUND`] when free.
    lock: AtomicUsize,
    in_use: AtomicBool,
    /// Token of the successor, written by the successor itself.
    next: AtomicUsize,
    /// Cleared by the predecessor on handoff.
    locked: AtomicBool,
}

impl Binding {
    fn new() -> Self {
        Binding {
            lock: AtomicUsize::new(UNBOUND),
            in_use: AtomicBool::new(false),
            next: AtomicUsize::new(NIL),
            locked: AtomicBool::new(false),
        }
    }
}

/// Binding tables for every worker, shared by all queue locks built on it.
///
/// The table is `workers x slots`; a worker may be queued on, or hold, at
/// most `slots` queue locks at the same time. Past that, an acquire spins
/// until one of the worker's own slots frees up.
pub struct WaitRegistry {
    bindings: Box<[CachePadded<Binding>]>,
    workers: usize,
    slots: usize,
    backoff: Backoff,
    next_lock_id: AtomicUsize,
}

impl WaitRegistry {
    /// Registry for `workers` workers with `slots` binding slots each.
    ///
    /// # Panics
    /// Panics if `workers` or `slots` is zero.
    pub fn new(workers: usize, slots: usize, backoff: Backoff) -> Arc<Self> {
        assert!(workers > 0, "registry needs at least one worker");
        assert!(slots > 0, "registry needs at least one binding slot");

        let bindings = (0..workers * slots)
            .map(|_| CachePadded::new(Binding::new()))
            .collect();

        Arc::new(WaitRegistry {
            bindings,
            workers,
            slots,
            backoff,
            next_lock_id: AtomicUsize::new(UNBOUND + 1),
        })
    }

    /// Number of workers with a binding row.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Binding slots per worker.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Strategy used by every wait on locks of this registry.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Slots of `worker` currently bound to some lock.
    pub fn bound_slots(&self, worker: usize) -> usize {
        self.row(worker)
            .filter(|&idx| self.bindings[idx].value.in_use.load(Ordering::Relaxed))
            .count()
    }

    fn row(&self, worker: usize) -> core::ops::Range<usize> {
        assert!(
            worker < self.workers,
            "worker {worker} out of range (workers = {})",
            self.workers
        );
        worker * self.slots..(worker + 1) * self.slots
    }

    fn allocate_lock_id(&self) -> usize {
        self.next_lock_id.fetch_add(1, Ordering::Relaxed)
    }

    fn try_bind(&self, worker: usize, lock_id: usize) -> Option<usize> {
        self.row(worker).find(|&idx| {
            let b = &self.bindings[idx].value;
            if b.in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            b.lock.store(lock_id, Ordering::Relaxed);
            b.next.store(NIL, Ordering::Relaxed);
            b.locked.store(false, Ordering::Relaxed);
            true
        })
    }

    fn bind(&self, worker: usize, lock_id: usize) -> usize {
        if let Some(idx) = self.try_bind(worker, lock_id) {
            return idx;
        }
        trace!(worker, "binding table full, waiting for a free slot");
        let mut step = 0u32;
        loop {
            step = self.backoff.snooze(step);
            if let Some(idx) = self.try_bind(worker, lock_id) {
                return idx;
            }
        }
    }

    fn find(&self, worker: usize, lock_id: usize) -> Option<usize> {
        self.row(worker).find(|&idx| {
            let b = &self.bindings[idx].value;
            b.in_use.load(Ordering::Relaxed) && b.lock.load(Ordering::Relaxed) == lock_id
        })
    }

    fn is_bound_to(&self, idx: usize, lock_id: usize) -> bool {
        let b = &self.bindings[idx].value;
        b.in_use.load(Ordering::Relaxed) && b.lock.load(Ordering::Relaxed) == lock_id
    }

    fn unbind(&self, idx: usize) {
        let b = &self.bindings[idx].value;
        b.lock.store(UNBOUND, Ordering::Relaxed);
        b.in_use.store(false, Ordering::Release);
    }

    #[inline(always)]
    fn node(&self, token: usize) -> &Binding {
        &self.bindings[token - 1].value
    }
}

impl fmt::Debug for WaitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitRegistry")
            .field("workers", &self.workers)
            .field("slots", &self.slots)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Fair FIFO lock (Mellor-Crummey/Scott).
///
/// Grant order is the order in which acquirers swap themselves into the
/// tail. Release hands the lock directly to the next waiter.
pub struct QueueLock {
    tail: CachePadded<AtomicUsize>,
    id: usize,
    registry: Arc<WaitRegistry>,
}

impl QueueLock {
    /// Idle lock whose waiters use binding slots from `registry`.
    pub fn new(registry: &Arc<WaitRegistry>) -> Self {
        QueueLock {
            tail: CachePadded::new(AtomicUsize::new(NIL)),
            id: registry.allocate_lock_id(),
            registry: Arc::clone(registry),
        }
    }

    /// Registry providing this lock's wait nodes.
    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    /// Block (spinning) until `worker` holds the lock.
    ///
    /// # Panics
    /// Panics if `worker` is outside the registry's worker range.
    pub fn acquire(&self, worker: usize) -> WaitHandle<'_> {
        let idx = self.registry.bind(worker, self.id);
        self.enqueue(worker, idx);
        WaitHandle {
            lock: self,
            worker,
            idx,
        }
    }

    /// Take the lock only if it is idle. A single compare-and-swap; never
    /// waits, not even for a free binding slot.
    ///
    /// # Panics
    /// Panics if `worker` is outside the registry's worker range.
    pub fn try_acquire(&self, worker: usize) -> Option<WaitHandle<'_>> {
        let idx = self.try_enqueue(worker)?;
        Some(WaitHandle {
            lock: self,
            worker,
            idx,
        })
    }

    /// Release through the handle returned by [`QueueLock::acquire`].
    ///
    /// Equivalent to dropping the handle. A handle from a different lock is
    /// still released on its own lock; the mismatch itself follows the
    /// release-without-hold policy.
    pub fn release(&self, handle: WaitHandle<'_>) {
        if !core::ptr::eq(handle.lock, self) {
            super::release_not_held("queue lock", Some(handle.worker));
        }
        drop(handle);
    }

    /// Acquire without a handle; the binding table remembers the hold.
    /// Pair with [`QueueLock::release_raw`] from the same worker.
    pub fn acquire_raw(&self, worker: usize) {
        let idx = self.registry.bind(worker, self.id);
        self.enqueue(worker, idx);
    }

    /// Handle-less [`QueueLock::try_acquire`].
    pub fn try_acquire_raw(&self, worker: usize) -> bool {
        self.try_enqueue(worker).is_some()
    }

    /// Release the hold of `worker`, located by scanning its binding row.
    ///
    /// If `worker` does not hold this lock the call is a no-op (after a
    /// warning) in release builds and panics with debug assertions enabled.
    pub fn release_raw(&self, worker: usize) {
        match self.registry.find(worker, self.id) {
            Some(idx) => self.dequeue(worker, idx),
            None => super::release_not_held("queue lock", Some(worker)),
        }
    }

    /// Whether any worker holds or waits for the lock.
    pub fn is_locked(&self) -> bool {
        self.tail.value.load(Ordering::Relaxed) != NIL
    }

    /// Worker owning the queue tail: the last arrival, which is the holder
    /// when nobody is waiting. `None` when the lock is idle.
    pub fn tail_worker(&self) -> Option<usize> {
        match self.tail.value.load(Ordering::Acquire) {
            NIL => None,
            token => Some((token - 1) / self.registry.slots),
        }
    }

    fn try_enqueue(&self, worker: usize) -> Option<usize> {
        let idx = self.registry.try_bind(worker, self.id)?;
        let token = idx + 1;
        let won = self
            .tail
            .value
            .compare_exchange(NIL, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            trace!(worker, lock = self.id, "queue lock try-acquired");
            Some(idx)
        } else {
            self.registry.unbind(idx);
            None
        }
    }

    fn enqueue(&self, worker: usize, idx: usize) {
        let token = idx + 1;
        let me = self.registry.node(token);
        me.next.store(NIL, Ordering::Relaxed);
        me.locked.store(true, Ordering::Relaxed);

        let pred = self.tail.value.swap(token, Ordering::AcqRel);
        if pred == NIL {
            trace!(worker, lock = self.id, "queue lock acquired uncontended");
            return;
        }

        self.registry.node(pred).next.store(token, Ordering::Release);
        let snoozes = self
            .registry
            .backoff
            .wait_until(|| !me.locked.load(Ordering::Acquire));
        trace!(worker, lock = self.id, snoozes, "queue lock handed over");
    }

    fn dequeue(&self, worker: usize, idx: usize) {
        let token = idx + 1;
        let me = self.registry.node(token);
        let mut succ = me.next.load(Ordering::Acquire);

        if succ == NIL {
            if self
                .tail
                .value
                .compare_exchange(token, NIL, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.registry.unbind(idx);
                trace!(worker, lock = self.id, "queue lock released idle");
                return;
            }
            // A successor swapped the tail but has not linked itself yet.
            let backoff = self.registry.backoff;
            let mut step = 0u32;
            loop {
                step = backoff.snooze(step);
                succ = me.next.load(Ordering::Acquire);
                if succ != NIL {
                    break;
                }
            }
        }

        self.registry.node(succ).locked.store(false, Ordering::Release);
        self.registry.unbind(idx);
        trace!(
            worker,
            lock = self.id,
            successor = (succ - 1) / self.registry.slots,
            "queue lock handed off"
        );
    }

    fn release_slot(&self, worker: usize, idx: usize) {
        if self.registry.is_bound_to(idx, self.id) {
            self.dequeue(worker, idx);
        } else {
            super::release_not_held("queue lock", Some(worker));
        }
    }
}

impl fmt::Debug for QueueLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueLock")
            .field("id", &self.id)
            .field("tail_worker", &self.tail_worker())
            .finish()
    }
}

/// Held [`QueueLock`]; names the wait node directly, releases on drop.
#[must_use = "dropping the handle releases the lock immediately"]
pub struct WaitHandle<'a> {
    lock: &'a QueueLock,
    worker: usize,
    idx: usize,
}

impl WaitHandle<'_> {
    /// Worker holding the lock.
    pub fn worker(&self) -> usize {
        self.worker
    }
}

impl fmt::Debug for WaitHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle")
            .field("lock", &self.lock.id)
            .field("worker", &self.worker)
            .field("slot", &(self.idx % self.lock.registry.slots))
            .finish()
    }
}

impl Drop for WaitHandle<'_> {
    fn drop(&mut self) {
        self.lock.release_slot(self.worker, self.idx);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    fn registry(workers: usize, slots: usize) -> Arc<WaitRegistry> {
        WaitRegistry::new(workers, slots, Backoff::Adaptive { spin_limit: 16 })
    }

    #[test]
    fn acquire_release_uncontended() {
        let reg = registry(2, 2);
        let lock = QueueLock::new(&reg);
        assert!(!lock.is_locked());
        let h = lock.acquire(0);
        assert!(lock.is_locked());
        assert_eq!(lock.tail_worker(), Some(0));
        assert_eq!(reg.bound_slots(0), 1);
        lock.release(h);
        assert!(!lock.is_locked());
        assert_eq!(reg.bound_slots(0), 0);
    }

    #[test]
    fn try_acquire_only_when_idle() {
        let reg = registry(2, 2);
        let lock = QueueLock::new(&reg);
        let h = lock.try_acquire(0).expect("idle lock");
        assert!(lock.try_acquire(1).is_none());
        assert_eq!(reg.bound_slots(1), 0, "failed try must free its slot");
        drop(h);
        assert!(lock.try_acquire(1).is_some());
    }

    #[test]
    fn one_worker_holds_several_locks() {
        let reg = registry(1, 2);
        let a = QueueLock::new(&reg);
        let b = QueueLock::new(&reg);
        let c = QueueLock::new(&reg);
        let ha = a.acquire(0);
        let hb = b.acquire(0);
        assert_eq!(reg.bound_slots(0), 2);
        assert!(c.try_acquire(0).is_none(), "binding table is full");
        drop(ha);
        let hc = c.try_acquire(0).expect("slot freed by release of a");
        drop(hb);
        drop(hc);
        assert_eq!(reg.bound_slots(0), 0);
    }

    #[test]
    fn raw_release_scans_the_binding_row() {
        let reg = registry(2, 4);
        let a = QueueLock::new(&reg);
        let b = QueueLock::new(&reg);
        a.acquire_raw(1);
        b.acquire_raw(1);
        a.release_raw(1);
        assert!(!a.is_locked());
        assert!(b.is_locked());
        b.release_raw(1);
        assert_eq!(reg.bound_slots(1), 0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "not held"))]
    fn release_without_hold_is_noop_in_release() {
        let reg = registry(2, 1);
        let lock = QueueLock::new(&reg);
        let _h = lock.acquire(0);
        lock.release_raw(1);
        assert_eq!(lock.tail_worker(), Some(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn unknown_worker_panics() {
        let reg = registry(2, 1);
        let lock = QueueLock::new(&reg);
        let _h = lock.acquire(2);
    }

    #[test]
    fn grants_in_arrival_order() {
        let reg = registry(4, 1);
        let lock = Arc::new(QueueLock::new(&reg));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.acquire(0);
        let mut waiters = Vec::new();
        for worker in 1..4 {
            let waiter_lock = lock.clone();
            let order = order.clone();
            waiters.push(thread::spawn(move || {
                let _h = waiter_lock.acquire(worker);
                order.lock().unwrap().push(worker);
            }));
            // The next waiter is started only once this one owns the tail.
            while lock.tail_worker() != Some(worker) {
                thread::yield_now();
            }
        }
        drop(first);
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(!lock.is_locked());
    }
}
