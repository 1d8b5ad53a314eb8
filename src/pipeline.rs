//! Multi-producer / single-consumer packet pipeline.
//!
//! Producers claim job indices from the dispenser, wrap each job in a pool
//! block and queue it on the to-send queue. The consumer copies every queued
//! block, sequences it into the window tracker's sent queue, and reclaims
//! sent blocks through simulated acknowledgments.
//!
//! All shared state is built once in [`Pipeline::new`], before any worker
//! runs; workers then only see it through `&Pipeline`.

use std::sync::{Arc, Barrier};
use std::thread;

use tracing::{debug, error, info, trace};

use crate::alloc::SlotAllocator;
use crate::block::{BlockArena, Descriptor};
use crate::config::PipelineConfig;
use crate::dispenser::JobDispenser;
use crate::error::{Error, Result};
use crate::fifo::FifoQueue;
use crate::lock::{AnyLock, Guarded, SpinLock, WaitRegistry};
use crate::platform::{BulkCopy, CycleCounter, JobDescriptor};
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::window::WindowTracker;

/// Worker id of the consumer. Producers are `1..=producers`.
pub const CONSUMER_WORKER: usize = 0;

/// Shared state of one pipeline run.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<WaitRegistry>,
    arena: Arc<BlockArena>,
    allocator: Guarded<SpinLock, SlotAllocator>,
    to_send: Guarded<AnyLock, FifoQueue>,
    sent: Arc<Guarded<AnyLock, FifoQueue>>,
    dispenser: JobDispenser<SpinLock>,
    producers_taken: Box<[AtomicBool]>,
    producers_done: AtomicUsize,
    in_flight: AtomicUsize,
    consumer_taken: AtomicBool,
}

impl Pipeline {
    /// Validate `config` and build every shared structure.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let registry = WaitRegistry::new(config.workers(), config.binding_slots, config.lock_backoff);
        let arena = BlockArena::new(config.pool_capacity);
        let allocator = Guarded::new(
            SpinLock::with_backoff(config.lock_backoff),
            SlotAllocator::new(arena.clone(), config.alloc_order),
        );
        let to_send = Guarded::new(
            AnyLock::new(config.queue_lock, &registry),
            FifoQueue::new(arena.clone()),
        );
        let sent = Arc::new(Guarded::new(
            AnyLock::new(config.queue_lock, &registry),
            FifoQueue::new(arena.clone()),
        ));
        let dispenser = JobDispenser::new(
            SpinLock::with_backoff(config.dispenser_backoff),
            config.job_count,
        );

        Ok(Pipeline {
            producers_taken: (0..config.producers).map(|_| AtomicBool::new(false)).collect(),
            producers_done: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            consumer_taken: AtomicBool::new(false),
            config,
            registry,
            arena,
            allocator,
            to_send,
            sent,
            dispenser,
        })
    }

    /// Configuration the pipeline was built from.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Queue-lock binding tables of all workers.
    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    /// Block arena shared by the pool and both queues.
    pub fn arena(&self) -> &Arc<BlockArena> {
        &self.arena
    }

    /// The guarded slot pool.
    pub fn allocator(&self) -> &Guarded<SpinLock, SlotAllocator> {
        &self.allocator
    }

    /// The guarded to-send queue.
    pub fn to_send(&self) -> &Guarded<AnyLock, FifoQueue> {
        &self.to_send
    }

    /// The guarded sent queue.
    pub fn sent(&self) -> &Arc<Guarded<AnyLock, FifoQueue>> {
        &self.sent
    }

    /// The job dispenser.
    pub fn dispenser(&self) -> &JobDispenser<SpinLock> {
        &self.dispenser
    }

    /// Driver for producer `worker` (in `1..=producers`). Each producer can
    /// be taken once; dropping it, run or not, counts it as finished.
    pub fn producer(&self, worker: usize) -> Result<Producer<'_>> {
        let slot = worker
            .checked_sub(1)
            .and_then(|i| self.producers_taken.get(i))
            .ok_or(Error::WorkerOutOfRange {
                worker,
                workers: self.config.workers(),
            })?;
        if slot.swap(true, Ordering::AcqRel) {
            return Err(Error::ProducerTaken { worker });
        }
        Ok(Producer {
            pipeline: self,
            worker,
            claiming: false,
        })
    }

    /// Driver for the single consumer.
    pub fn consumer(&self) -> Result<Consumer<'_>> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(Error::ConsumerTaken);
        }
        Ok(Consumer {
            pipeline: self,
            tracker: WindowTracker::new(self.config.window, self.arena.clone(), self.sent.clone()),
        })
    }

    /// Run every producer and the consumer on their own threads until all
    /// jobs are transmitted and acknowledged.
    pub fn run<C, K>(&self, jobs: &[JobDescriptor], copier: &C, clock: &K) -> Result<PipelineReport>
    where
        C: BulkCopy,
        K: CycleCounter,
    {
        check_job_table(self.dispenser.bound(), jobs)?;
        let consumer = self.consumer()?;
        let producers = (1..=self.config.producers)
            .map(|w| self.producer(w))
            .collect::<Result<Vec<_>>>()?;

        info!(
            producers = self.config.producers,
            jobs = self.dispenser.bound(),
            pool_capacity = self.config.pool_capacity,
            queue_lock = ?self.config.queue_lock,
            "pipeline starting"
        );

        let barrier = Barrier::new(producers.len() + 1);
        let start = clock.now();
        let (consumer_stats, producer_results) = thread::scope(|s| {
            let barrier = &barrier;
            let handles: Vec<_> = producers
                .into_iter()
                .map(|p| {
                    s.spawn(move || {
                        barrier.wait();
                        p.run(jobs)
                    })
                })
                .collect();
            let consumer = s.spawn(move || {
                barrier.wait();
                consumer.run(copier, clock)
            });

            let producer_results: Vec<_> = handles.into_iter().map(join).collect();
            (join(consumer), producer_results)
        });
        let elapsed = clock.now().saturating_sub(start);
        let producer_stats = producer_results.into_iter().collect::<Result<Vec<_>>>()?;

        let report = self.report(producer_stats, consumer_stats, elapsed);
        info!(
            transferred = report.consumer.transferred,
            bytes = report.consumer.bytes,
            next_seq = report.consumer.next_seq,
            ack_seq = report.consumer.ack_seq,
            alloc_retries = report.alloc_retries(),
            elapsed,
            "pipeline finished"
        );
        Ok(report)
    }

    fn report(&self, producers: Vec<ProducerStats>, consumer: ConsumerStats, elapsed: u64) -> PipelineReport {
        let w = CONSUMER_WORKER;
        let (free_len, available, outstanding, capacity) = self
            .allocator
            .with(w, |a| (a.free_len(), a.available(), a.outstanding(), a.capacity()));
        PipelineReport {
            producers,
            consumer,
            to_send_len: self.to_send.with(w, |q| q.len()),
            sent_len: self.sent.with(w, |q| q.len()),
            free_len,
            available,
            outstanding,
            capacity,
            elapsed,
        }
    }

    /// No further block can reach the to-send queue: every producer has
    /// finished, or every job is claimed and no claimed job is still on its
    /// way to the queue. The second case covers producers never taken.
    fn input_drained(&self) -> bool {
        if self.producers_done.load(Ordering::Acquire) == self.config.producers {
            return true;
        }
        // Claims bump `in_flight` before taking the dispenser lock, so an
        // exhausted dispenser makes every such bump visible here.
        self.dispenser.remaining(CONSUMER_WORKER) == 0 && self.in_flight.load(Ordering::Acquire) == 0
    }
}

fn check_job_table(bound: u32, jobs: &[JobDescriptor]) -> Result<()> {
    if jobs.len() < bound as usize {
        return Err(Error::JobTableTooShort {
            bound,
            len: jobs.len(),
        });
    }
    Ok(())
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// What one producer did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Producer worker id.
    pub worker: usize,
    /// Blocks queued.
    pub produced: usize,
    /// Payload bytes queued.
    pub bytes: usize,
    /// Failed allocations that were retried.
    pub alloc_retries: u64,
}

/// Producer-side driver.
#[derive(Debug)]
pub struct Producer<'a> {
    pipeline: &'a Pipeline,
    worker: usize,
    claiming: bool,
}

impl Producer<'_> {
    /// Worker id of this producer.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Claim jobs until the dispenser runs dry, queueing one block per job.
    /// An exhausted pool is waited out, never skipped.
    pub fn run(mut self, jobs: &[JobDescriptor]) -> Result<ProducerStats> {
        let p = self.pipeline;
        let worker = self.worker;
        check_job_table(p.dispenser.bound(), jobs)?;

        let mut stats = ProducerStats {
            worker,
            ..ProducerStats::default()
        };
        loop {
            self.begin_claim();
            let Some(idx) = p.dispenser.next(worker) else {
                break;
            };
            let job = jobs[idx as usize];

            let mut step = 0u32;
            let block = loop {
                if let Some(block) = p.allocator.with(worker, SlotAllocator::alloc) {
                    break block;
                }
                stats.alloc_retries += 1;
                step = p.config.alloc_retry_backoff.snooze(step);
            };
            if step > 0 {
                debug!(worker, job = idx, retries = step, "allocated after pool back-pressure");
            }

            p.arena.set_descriptor(
                &block,
                Descriptor {
                    src: job.src,
                    tgt: job.tgt,
                    len: job.len,
                },
            );
            trace!(worker, job = idx, user = job.user_id, block = block.id().index(), len = job.len, "queueing block");
            p.to_send.with(worker, |q| q.push_back(block));
            self.end_claim();

            stats.produced += 1;
            stats.bytes += job.len;
        }

        debug!(worker, produced = stats.produced, retries = stats.alloc_retries, "producer finished");
        Ok(stats)
    }

    fn begin_claim(&mut self) {
        self.pipeline.in_flight.fetch_add(1, Ordering::AcqRel);
        self.claiming = true;
    }

    fn end_claim(&mut self) {
        self.claiming = false;
        self.pipeline.in_flight.fetch_sub(1, Ordering::Release);
    }
}

impl Drop for Producer<'_> {
    fn drop(&mut self) {
        if self.claiming {
            self.end_claim();
        }
        self.pipeline.producers_done.fetch_add(1, Ordering::Release);
    }
}

/// What the consumer did, plus the final window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Blocks copied and sequenced.
    pub transferred: usize,
    /// Payload bytes copied.
    pub bytes: usize,
    /// Copies that failed; their blocks went straight back to the pool.
    pub copy_failures: usize,
    /// Counter ticks spent inside the copy routine.
    pub copy_cycles: u64,
    /// Transfers that carried a poll.
    pub polls: u64,
    /// Simulated acknowledgments.
    pub acks: u64,
    /// Final next sequence number.
    pub next_seq: u32,
    /// Final acknowledged sequence number.
    pub ack_seq: u32,
}

/// Consumer-side driver; owns the window tracker.
#[derive(Debug)]
pub struct Consumer<'a> {
    pipeline: &'a Pipeline,
    tracker: WindowTracker<AnyLock>,
}

impl Consumer<'_> {
    /// The window tracker.
    pub fn tracker(&self) -> &WindowTracker<AnyLock> {
        &self.tracker
    }

    /// Drain the to-send queue until no more input can arrive and the queue
    /// is empty, then acknowledge everything still in flight. Input is over
    /// once every producer has finished, or once the dispenser is exhausted
    /// with no claimed job left to queue, so producers that are never taken
    /// do not hold the consumer.
    pub fn run<C: BulkCopy, K: CycleCounter>(mut self, copier: &C, clock: &K) -> ConsumerStats {
        let p = self.pipeline;
        let w = CONSUMER_WORKER;
        let mut stats = ConsumerStats::default();

        let mut step = 0u32;
        loop {
            // A push precedes the mark that makes the input look drained,
            // so one more pop after seeing it drained is final.
            let block = match p.to_send.with(w, FifoQueue::pop_front) {
                Some(block) => block,
                None if p.input_drained() => match p.to_send.with(w, FifoQueue::pop_front) {
                    Some(block) => block,
                    None => break,
                },
                None => {
                    step = p.config.lock_backoff.snooze(step);
                    continue;
                }
            };
            step = 0;

            let d = p.arena.descriptor(&block);
            let t0 = clock.now();
            let copied = copier.copy(d.tgt, d.src, d.len);
            stats.copy_cycles += clock.now().saturating_sub(t0);

            match copied {
                Ok(()) => {
                    let tx = self.tracker.on_transfer_complete(w, block);
                    stats.transferred += 1;
                    stats.bytes += d.len;
                    debug!(seq = tx.seq, poll = tx.poll, src = d.src, tgt = d.tgt, len = d.len, "block transferred");
                    self.tracker.maybe_ack(w, &p.allocator);
                }
                Err(e) => {
                    error!(error = %e, src = d.src, tgt = d.tgt, len = d.len, "copy failed, dropping block");
                    stats.copy_failures += 1;
                    p.allocator.with(w, |a| a.free(block));
                }
            }
        }

        let flushed = self.tracker.flush(w, &p.allocator);
        debug!(flushed, "window flushed");

        stats.polls = self.tracker.polls();
        stats.acks = self.tracker.acks();
        stats.next_seq = self.tracker.next_seq();
        stats.ack_seq = self.tracker.ack_seq();
        stats
    }
}

/// Final state of a [`Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Per-producer statistics, in worker order.
    pub producers: Vec<ProducerStats>,
    /// Consumer statistics and final window.
    pub consumer: ConsumerStats,
    /// Blocks left on the to-send queue.
    pub to_send_len: usize,
    /// Blocks left on the sent queue.
    pub sent_len: usize,
    /// Blocks on the allocator's free list.
    pub free_len: usize,
    /// Blocks the allocator could still hand out.
    pub available: usize,
    /// Blocks not returned to the allocator.
    pub outstanding: usize,
    /// Pool capacity.
    pub capacity: usize,
    /// Counter ticks from start barrier to last join.
    pub elapsed: u64,
}

impl PipelineReport {
    /// Blocks queued by all producers.
    pub fn produced(&self) -> usize {
        self.producers.iter().map(|p| p.produced).sum()
    }

    /// Allocation retries across all producers.
    pub fn alloc_retries(&self) -> u64 {
        self.producers.iter().map(|p| p.alloc_retries).sum()
    }
}
