//! Collaborators outside the pipeline core: the bulk copy engine, the cycle
//! counter and the job descriptor table.

use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// One entry of the externally populated job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Originating user.
    pub user_id: u32,
    /// Source address of the payload.
    pub src: usize,
    /// Target address of the payload.
    pub tgt: usize,
    /// Payload length in bytes.
    pub len: usize,
}

/// Synchronous bulk copy, invoked once per transmitted block.
pub trait BulkCopy: Sync {
    /// Copy `len` bytes from `src` to `dst`. Must be complete on return.
    fn copy(&self, dst: usize, src: usize, len: usize) -> Result<()>;
}

impl<C: BulkCopy + ?Sized> BulkCopy for &C {
    fn copy(&self, dst: usize, src: usize, len: usize) -> Result<()> {
        (**self).copy(dst, src, len)
    }
}

/// Monotonic counter for instrumentation only.
pub trait CycleCounter: Sync {
    /// Current counter value.
    fn now(&self) -> u64;
}

/// [`CycleCounter`] counting nanoseconds since construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Clock starting at zero now.
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for MonotonicClock {
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// [`BulkCopy`] between two in-memory regions; addresses are byte offsets
/// into the source and target region respectively.
#[derive(Debug)]
pub struct BufferCopy {
    source: Vec<u8>,
    target: Mutex<Vec<u8>>,
}

impl BufferCopy {
    /// Copy engine reading `source` into a zeroed target of `target_len` bytes.
    pub fn new(source: Vec<u8>, target_len: usize) -> Self {
        BufferCopy {
            source,
            target: Mutex::new(vec![0; target_len]),
        }
    }

    /// Source region.
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// Copy of the current target region.
    pub fn target(&self) -> Vec<u8> {
        self.target.lock().clone()
    }
}

impl BulkCopy for BufferCopy {
    fn copy(&self, dst: usize, src: usize, len: usize) -> Result<()> {
        let from = checked_range(src, len, self.source.len())?;
        let mut target = self.target.lock();
        let to = checked_range(dst, len, target.len())?;
        target[to].copy_from_slice(&self.source[from]);
        Ok(())
    }
}

fn checked_range(addr: usize, len: usize, limit: usize) -> Result<std::ops::Range<usize>> {
    match addr.checked_add(len) {
        Some(end) if end <= limit => Ok(addr..end),
        _ => Err(Error::CopyOutOfBounds { addr, len, limit }),
    }
}
