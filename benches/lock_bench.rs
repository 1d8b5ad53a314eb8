use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

use cluster_pipeline::{
    AllocOrder, Backoff, BlockArena, BufferCopy, Descriptor, FifoQueue, Guarded, JobDescriptor, LockKind,
    MonotonicClock, Pipeline, PipelineConfig, QueueLock, SlotAllocator, SpinLock, WaitRegistry,
};
use crossbeam_channel::bounded;
use flume::bounded as flume_bounded;

const WORKERS: usize = 4;
const ROUNDS: usize = 50_000;
const BLOCKS: usize = 200_000;
const POOL: usize = 1024;

/// `WORKERS` threads each bump a shared counter `ROUNDS` times.
fn contend<F>(bump: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let bump = Arc::new(bump);
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let bump = bump.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    bump(worker);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

fn bench_lock_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("4_workers_counter");
    group.throughput(Throughput::Elements((WORKERS * ROUNDS) as u64));

    group.bench_function("queue_lock", |b| {
        b.iter(|| {
            let reg = WaitRegistry::new(WORKERS, 1, Backoff::default());
            let counter = Guarded::new(QueueLock::new(&reg), 0u64);
            contend(move |w| counter.with(w, |v| *v = black_box(*v + 1)));
        });
    });

    group.bench_function("spin_lock", |b| {
        b.iter(|| {
            let counter = Guarded::new(SpinLock::new(), 0u64);
            contend(move |w| counter.with(w, |v| *v = black_box(*v + 1)));
        });
    });

    group.bench_function("parking_lot_mutex", |b| {
        b.iter(|| {
            let counter = parking_lot::Mutex::new(0u64);
            contend(move |_| {
                let mut v = counter.lock();
                *v = black_box(*v + 1);
            });
        });
    });

    group.bench_function("std_mutex", |b| {
        b.iter(|| {
            let counter = std::sync::Mutex::new(0u64);
            contend(move |_| {
                let mut v = counter.lock().unwrap();
                *v = black_box(*v + 1);
            });
        });
    });

    group.finish();
}

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_acquire_release");

    let reg = WaitRegistry::new(1, 1, Backoff::default());
    let queue_lock = QueueLock::new(&reg);
    group.bench_function("queue_lock", |b| {
        b.iter(|| {
            let h = queue_lock.acquire(0);
            queue_lock.release(black_box(h));
        });
    });

    let spin = SpinLock::new();
    group.bench_function("spin_lock", |b| {
        b.iter(|| drop(black_box(spin.acquire())));
    });

    let mutex = parking_lot::Mutex::new(());
    group.bench_function("parking_lot_mutex", |b| {
        b.iter(|| drop(black_box(mutex.lock())));
    });

    group.finish();
}

fn bench_4p_1c_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("4p_1c_handoff");
    group.throughput(Throughput::Elements(BLOCKS as u64));
    const PER_PRODUCER: usize = BLOCKS / WORKERS;

    group.bench_function("guarded_fifo", |b| {
        b.iter(|| {
            let reg = WaitRegistry::new(WORKERS + 1, 2, Backoff::default());
            let arena = BlockArena::new(POOL);
            let alloc = Arc::new(Guarded::new(
                SpinLock::new(),
                SlotAllocator::new(arena.clone(), AllocOrder::FreeListFirst),
            ));
            let queue = Arc::new(Guarded::new(QueueLock::new(&reg), FifoQueue::new(arena.clone())));
            let mut handles = vec![];

            for p in 1..=WORKERS {
                let alloc = alloc.clone();
                let queue = queue.clone();
                let arena = arena.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let block = loop {
                            match alloc.with(p, SlotAllocator::alloc) {
                                Some(b) => break b,
                                None => std::hint::spin_loop(),
                            }
                        };
                        arena.set_descriptor(&block, Descriptor { src: i, tgt: i, len: 1 });
                        queue.with(p, |q| q.push_back(block));
                    }
                }));
            }

            let mut received = 0;
            while received < BLOCKS {
                match queue.with(0, FifoQueue::pop_front) {
                    Some(block) => {
                        black_box(arena.descriptor(&block));
                        alloc.with(0, |a| a.free(block));
                        received += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.bench_function("crossbeam_channel", |b| {
        b.iter(|| {
            let (tx, rx) = bounded::<Descriptor>(POOL);
            let mut handles = vec![];
            for _ in 0..WORKERS {
                let tx = tx.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send(Descriptor { src: i, tgt: i, len: 1 }).unwrap();
                    }
                }));
            }
            for _ in 0..BLOCKS {
                black_box(rx.recv().unwrap());
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.bench_function("flume", |b| {
        b.iter(|| {
            let (tx, rx) = flume_bounded::<Descriptor>(POOL);
            let mut handles = vec![];
            for _ in 0..WORKERS {
                let tx = tx.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send(Descriptor { src: i, tgt: i, len: 1 }).unwrap();
                    }
                }));
            }
            for _ in 0..BLOCKS {
                black_box(rx.recv().unwrap());
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_400_jobs");
    group.throughput(Throughput::Elements(400));
    group.sample_size(20);

    let jobs: Vec<_> = (0..400)
        .map(|i| JobDescriptor {
            user_id: 0,
            src: i * 256,
            tgt: i * 256,
            len: 256,
        })
        .collect();

    for (name, queue_lock) in [("queue_lock", LockKind::Queue), ("spin_lock", LockKind::Spin)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let config = PipelineConfig {
                    queue_lock,
                    ..PipelineConfig::default()
                };
                let copier = BufferCopy::new(vec![0xAB; 400 * 256], 400 * 256);
                let pipeline = Pipeline::new(config).unwrap();
                black_box(pipeline.run(&jobs, &copier, &MonotonicClock::new()).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_contention,
    bench_uncontended,
    bench_4p_1c_handoff,
    bench_pipeline
);
criterion_main!(benches);
