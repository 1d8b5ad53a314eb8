#![cfg(loom)]

use cluster_pipeline::{
    AllocOrder, Backoff, BlockArena, Descriptor, FifoQueue, Guarded, JobDispenser, QueueLock, SlotAllocator,
    SpinLock, WaitRegistry,
};
use loom::sync::Arc;
use loom::thread;

#[test]
fn loom_queue_lock_counter() {
    loom::model(|| {
        let reg = WaitRegistry::new(2, 1, Backoff::Yield);
        let counter = Arc::new(Guarded::new(QueueLock::new(&reg), 0usize));

        let c = counter.clone();
        let t = thread::spawn(move || {
            c.with(1, |v| *v += 1);
        });
        counter.with(0, |v| *v += 1);
        t.join().unwrap();

        assert_eq!(counter.with(0, |v| *v), 2);
        assert!(!counter.lock().is_locked());
        assert_eq!(reg.bound_slots(0), 0);
        assert_eq!(reg.bound_slots(1), 0);
    });
}

#[test]
fn loom_spin_lock_counter() {
    loom::model(|| {
        let counter = Arc::new(Guarded::new(SpinLock::with_backoff(Backoff::Yield), 0usize));

        let c = counter.clone();
        let t = thread::spawn(move || {
            c.with(1, |v| *v += 1);
        });
        counter.with(0, |v| *v += 1);
        t.join().unwrap();

        assert_eq!(counter.with(0, |v| *v), 2);
    });
}

#[test]
fn loom_queue_lock_try_acquire() {
    loom::model(|| {
        let reg = WaitRegistry::new(2, 1, Backoff::Yield);
        let lock = Arc::new(QueueLock::new(&reg));

        let l = lock.clone();
        let t = thread::spawn(move || {
            let h = l.acquire(1);
            l.release(h);
        });
        if let Some(h) = lock.try_acquire(0) {
            assert_eq!(lock.tail_worker(), Some(0));
            lock.release(h);
        }
        t.join().unwrap();

        assert!(!lock.is_locked());
    });
}

#[test]
fn loom_dispenser_hands_out_each_index_once() {
    loom::model(|| {
        let d = Arc::new(JobDispenser::new(SpinLock::with_backoff(Backoff::Yield), 2));

        let d1 = d.clone();
        let t = thread::spawn(move || d1.next(1));
        let mine = d.next(0);
        let theirs = t.join().unwrap();

        let mut got = vec![mine.unwrap(), theirs.unwrap()];
        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
        assert_eq!(d.next(0), None);
    });
}

#[test]
fn loom_guarded_fifo_handoff() {
    loom::model(|| {
        let reg = WaitRegistry::new(2, 1, Backoff::Yield);
        let arena = BlockArena::new(1);
        let alloc = Guarded::new(
            SpinLock::with_backoff(Backoff::Yield),
            SlotAllocator::new(arena.clone(), AllocOrder::FreeListFirst),
        );
        let queue = Arc::new(Guarded::new(QueueLock::new(&reg), FifoQueue::new(arena.clone())));

        let block = alloc.with(1, SlotAllocator::alloc).unwrap();
        let q = queue.clone();
        let a = arena.clone();
        let producer = thread::spawn(move || {
            a.set_descriptor(&block, Descriptor { src: 1, tgt: 2, len: 3 });
            q.with(1, |q| q.push_back(block));
        });

        let got = loop {
            if let Some(b) = queue.with(0, FifoQueue::pop_front) {
                break b;
            }
            thread::yield_now();
        };
        producer.join().unwrap();

        assert_eq!(arena.descriptor(&got), Descriptor { src: 1, tgt: 2, len: 3 });
        alloc.with(0, |a| a.free(got));
        assert_eq!(alloc.with(0, |a| a.free_len()), 1);
    });
}
