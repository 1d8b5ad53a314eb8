//! Bounded job-index dispenser.

use tracing::debug;

use crate::lock::{Guarded, RawLock};

/// Cursor over `0..bound`. Unsynchronized; see [`JobDispenser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCounter {
    bound: u32,
    cursor: u32,
}

impl JobCounter {
    /// Counter handing out `0..bound`.
    pub fn new(bound: u32) -> Self {
        JobCounter { bound, cursor: 0 }
    }

    /// Next index, or `None` once `bound` indices were handed out.
    pub fn next_index(&mut self) -> Option<u32> {
        if self.cursor >= self.bound {
            return None;
        }
        let idx = self.cursor;
        self.cursor += 1;
        Some(idx)
    }

    /// Indices not yet handed out.
    pub fn remaining(&self) -> u32 {
        self.bound - self.cursor
    }
}

/// Lock-guarded fetch-and-increment distributing each index of `0..bound`
/// to exactly one caller.
#[derive(Debug)]
pub struct JobDispenser<L> {
    counter: Guarded<L, JobCounter>,
    bound: u32,
}

impl<L: RawLock> JobDispenser<L> {
    /// Dispenser over `0..bound`, guarded by `lock`.
    pub fn new(lock: L, bound: u32) -> Self {
        JobDispenser {
            counter: Guarded::new(lock, JobCounter::new(bound)),
            bound,
        }
    }

    /// Claim the next job index. `None` tells the producer to stop.
    pub fn next(&self, worker: usize) -> Option<u32> {
        let claimed = self.counter.with(worker, JobCounter::next_index);
        if claimed.is_none() {
            debug!(worker, bound = self.bound, "job dispenser exhausted");
        }
        claimed
    }

    /// Configured bound `N`.
    pub fn bound(&self) -> u32 {
        self.bound
    }

    /// Indices not yet claimed.
    pub fn remaining(&self, worker: usize) -> u32 {
        self.counter.with(worker, |c| c.remaining())
    }
}
