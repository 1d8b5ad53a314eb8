//! Sequence numbering and simulated cumulative acknowledgment.
//!
//! This is the bookkeeping half of an ARQ sender, not a protocol: there are
//! no gaps, no NACKs and no retransmission. Acknowledgments are simulated by
//! releasing the oldest sent blocks in batches once enough are pending.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::alloc::SlotAllocator;
use crate::block::{BlockArena, BlockHandle};
use crate::config::WindowConfig;
use crate::fifo::FifoQueue;
use crate::lock::{Guarded, RawLock};

/// Outcome of [`WindowTracker::on_transfer_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmitted {
    /// Sequence number assigned to the block.
    pub seq: u32,
    /// Whether this PDU carries a poll (a without-poll threshold was hit).
    pub poll: bool,
}

/// Sender window `[ack_seq, next_seq)` over a queue of sent blocks.
///
/// Owned by the single consumer, which makes sequence assignment and the
/// sent-queue append one step. The sent queue itself is still lock-guarded
/// and may be shared for inspection.
#[derive(Debug)]
pub struct WindowTracker<L> {
    config: WindowConfig,
    arena: Arc<BlockArena>,
    sent: Arc<Guarded<L, FifoQueue>>,
    next_seq: u32,
    ack_seq: u32,
    pdu_without_poll: u32,
    byte_without_poll: usize,
    polls: u64,
    acks: u64,
}

impl<L: RawLock> WindowTracker<L> {
    /// Tracker appending to `sent`, a queue over `arena`.
    pub fn new(config: WindowConfig, arena: Arc<BlockArena>, sent: Arc<Guarded<L, FifoQueue>>) -> Self {
        WindowTracker {
            config,
            arena,
            sent,
            next_seq: 0,
            ack_seq: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            polls: 0,
            acks: 0,
        }
    }

    /// Stamp `block` with the next sequence number and move it to the sent
    /// queue. Call only after the block's copy has finished.
    pub fn on_transfer_complete(&mut self, worker: usize, block: BlockHandle) -> Transmitted {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let len = self.arena.descriptor(&block).len;
        self.pdu_without_poll += 1;
        self.byte_without_poll += len;
        let poll = self.pdu_without_poll >= self.config.poll_pdu
            || self.byte_without_poll >= self.config.poll_byte;
        if poll {
            self.pdu_without_poll = 0;
            self.byte_without_poll = 0;
            self.polls += 1;
        }

        self.arena.set_seq(&block, seq);
        self.sent.with(worker, |q| q.push_back(block));
        trace!(worker, seq, len, poll, "pdu transmitted");
        Transmitted { seq, poll }
    }

    /// Whether enough blocks are pending to simulate an acknowledgment.
    pub fn ack_due(&self, worker: usize) -> bool {
        self.sent_len(worker) >= self.config.ack_trigger
    }

    /// Acknowledge the oldest `batch` sent blocks and return them to
    /// `allocator`. With fewer pending, acknowledges what is there.
    /// Returns the number of blocks reclaimed.
    pub fn simulate_ack<A: RawLock>(
        &mut self,
        worker: usize,
        batch: usize,
        allocator: &Guarded<A, SlotAllocator>,
    ) -> usize {
        let mut reclaimed = 0;
        while reclaimed < batch {
            let Some(block) = self.sent.with(worker, FifoQueue::pop_front) else {
                break;
            };
            debug_assert_eq!(
                self.arena.seq(&block),
                self.ack_seq,
                "sent queue out of sequence order"
            );
            allocator.with(worker, |a| a.free(block));
            self.ack_seq = self.ack_seq.wrapping_add(1);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            self.acks += 1;
            debug!(
                worker,
                ack_seq = self.ack_seq,
                next_seq = self.next_seq,
                reclaimed,
                "cumulative ack simulated"
            );
        }
        reclaimed
    }

    /// Simulate one acknowledgment of the configured batch if due.
    pub fn maybe_ack<A: RawLock>(&mut self, worker: usize, allocator: &Guarded<A, SlotAllocator>) -> usize {
        if self.ack_due(worker) {
            self.simulate_ack(worker, self.config.ack_batch, allocator)
        } else {
            0
        }
    }

    /// Acknowledge everything outstanding.
    pub fn flush<A: RawLock>(&mut self, worker: usize, allocator: &Guarded<A, SlotAllocator>) -> usize {
        let mut total = 0;
        loop {
            let n = self.simulate_ack(worker, self.config.ack_batch, allocator);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Next sequence number to assign.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Oldest unacknowledged sequence number.
    pub fn ack_seq(&self) -> u32 {
        self.ack_seq
    }

    /// Width of the window, `next_seq - ack_seq`.
    pub fn in_flight(&self) -> u32 {
        self.next_seq.wrapping_sub(self.ack_seq)
    }

    /// Current length of the sent queue.
    pub fn sent_len(&self, worker: usize) -> usize {
        self.sent.with(worker, |q| q.len())
    }

    /// PDUs sent since the last poll.
    pub fn pdu_without_poll(&self) -> u32 {
        self.pdu_without_poll
    }

    /// Bytes sent since the last poll.
    pub fn byte_without_poll(&self) -> usize {
        self.byte_without_poll
    }

    /// Transfers that carried a poll.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Simulated acknowledgments that reclaimed at least one block.
    pub fn acks(&self) -> u64 {
        self.acks
    }

    /// The sent queue.
    pub fn sent(&self) -> &Arc<Guarded<L, FifoQueue>> {
        &self.sent
    }
}
