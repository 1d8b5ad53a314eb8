//! Crate-wide error type.

use thiserror::Error;

/// Errors raised while building or driving the pipeline.
///
/// Resource exhaustion is not an error here: allocator, queue, dispenser and
/// `try_acquire` exhaustion are all reported as `None`.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file is not valid TOML for [`crate::PipelineConfig`].
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// A worker id outside the configured worker range was used.
    #[error("worker {worker} out of range (workers = {workers})")]
    WorkerOutOfRange {
        /// Requested worker id.
        worker: usize,
        /// Number of workers the pipeline was built for.
        workers: usize,
    },

    /// A second consumer was requested for a single-consumer pipeline.
    #[error("pipeline consumer already taken")]
    ConsumerTaken,

    /// A producer driver for this worker was already handed out.
    #[error("producer for worker {worker} already taken")]
    ProducerTaken {
        /// Producer worker id.
        worker: usize,
    },

    /// The job table has fewer entries than the dispenser hands out.
    #[error("job table holds {len} descriptors but the dispenser bound is {bound}")]
    JobTableTooShort {
        /// Dispenser bound.
        bound: u32,
        /// Job table length.
        len: usize,
    },

    /// A copy touched bytes outside its source or target region.
    #[error("copy of {len} bytes at {addr:#x} exceeds region of {limit} bytes")]
    CopyOutOfBounds {
        /// Start address of the access.
        addr: usize,
        /// Requested length.
        len: usize,
        /// Size of the region.
        limit: usize,
    },

    /// The allocator cannot be reset while blocks are still handed out.
    #[error("allocator has {outstanding} outstanding blocks")]
    AllocatorBusy {
        /// Blocks not yet returned.
        outstanding: usize,
    },
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;
