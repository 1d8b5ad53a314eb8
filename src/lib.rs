//! cluster_pipeline - concurrency core of a many-core packet pipeline
//!
//! Several producer workers pull job indices from a shared dispenser, wrap
//! each job in a block from a bounded slot pool and queue it for
//! transmission. A single consumer copies queued blocks out, assigns
//! sequence numbers and simulates cumulative acknowledgments that hand the
//! blocks back to the pool.
//!
//! Shared state is guarded by either a fair MCS [`QueueLock`] with
//! per-worker wait nodes or a test-and-set [`SpinLock`]:
//!
//! ```
//! use cluster_pipeline::{BufferCopy, JobDescriptor, MonotonicClock, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig { producers: 2, pool_capacity: 16, job_count: 64, ..Default::default() };
//! let jobs: Vec<_> = (0..64)
//!     .map(|i| JobDescriptor { user_id: 0, src: i * 8, tgt: i * 8, len: 8 })
//!     .collect();
//! let copier = BufferCopy::new(vec![7; 64 * 8], 64 * 8);
//!
//! let pipeline = Pipeline::new(config).unwrap();
//! let report = pipeline.run(&jobs, &copier, &MonotonicClock::new()).unwrap();
//! assert_eq!(report.consumer.ack_seq, 64);
//! assert_eq!(report.available, report.capacity);
//! ```
#![warn(missing_docs)]

mod sync;

pub mod alloc;
pub mod backoff;
pub mod block;
pub mod config;
pub mod dispenser;
pub mod error;
pub mod fifo;
pub mod lock;
pub mod pipeline;
pub mod platform;
pub mod window;

pub use alloc::SlotAllocator;
pub use backoff::Backoff;
pub use block::{BlockArena, BlockHandle, BlockId, Descriptor, Owner, QueueTag};
pub use config::{AllocOrder, LockKind, PipelineConfig, WindowConfig};
pub use dispenser::{JobCounter, JobDispenser};
pub use error::{Error, Result};
pub use fifo::FifoQueue;
pub use lock::{AnyLock, Guarded, QueueLock, RawLock, SpinGuard, SpinLock, WaitHandle, WaitRegistry};
pub use pipeline::{Consumer, ConsumerStats, Pipeline, PipelineReport, Producer, ProducerStats, CONSUMER_WORKER};
pub use platform::{BufferCopy, BulkCopy, CycleCounter, JobDescriptor, MonotonicClock};
pub use window::{Transmitted, WindowTracker};

/// Keeps a hot atomic on its own cache line.
#[repr(align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        CachePadded { value }
    }
}
