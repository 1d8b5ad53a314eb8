use cluster_pipeline::{Backoff, Guarded, QueueLock, RawLock, SpinLock, WaitRegistry};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const ROUNDS: usize = 1_000_000;

fn main() {
    println!("Lock contention test");
    println!("====================\n");

    for workers in [1, 2, 4, 8] {
        println!("{workers} worker(s), {ROUNDS} acquisitions each:");

        let reg = WaitRegistry::new(workers, 1, Backoff::default());
        report("QueueLock", workers, QueueLock::new(&reg));
        report("SpinLock", workers, SpinLock::new());
        report("SpinLock (spin only)", workers, SpinLock::with_backoff(Backoff::Spin));
        println!();
    }
}

fn report<L: RawLock + 'static>(name: &str, workers: usize, lock: L) {
    let counter = Arc::new(Guarded::new(lock, 0usize));
    let start = Instant::now();

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    counter.with(worker, |v| *v += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let elapsed = start.elapsed();
    let total = workers * ROUNDS;
    assert_eq!(counter.with(0, |v| *v), total);
    println!(
        "  {name:<22} {:>10.2?}  {:>6.1} ns/op  {:>12.0} ops/sec",
        elapsed,
        elapsed.as_nanos() as f64 / total as f64,
        total as f64 / elapsed.as_secs_f64()
    );
}
