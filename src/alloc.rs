//! Fixed-size block pool: bump carving plus a reclaim free list.

use std::sync::Arc;

use tracing::debug;

use crate::block::{foreign_block, BlockArena, BlockHandle, Owner, NIL};
use crate::config::AllocOrder;
use crate::error::{Error, Result};
use crate::sync::Ordering;

/// Hands out blocks of a [`BlockArena`].
///
/// Performs no locking. Share it as a [`crate::Guarded`] so `alloc` and
/// `free` run with the guarding lock held; popping a block off the free list
/// under that lock is what keeps a block from being handed out twice.
#[derive(Debug)]
pub struct SlotAllocator {
    arena: Arc<BlockArena>,
    order: AllocOrder,
    /// Blocks `0..cursor` have been carved.
    cursor: u32,
    free_head: u32,
    free_len: usize,
    outstanding: usize,
}

impl SlotAllocator {
    /// Allocator over every block of `arena`, nothing carved yet.
    pub fn new(arena: Arc<BlockArena>, order: AllocOrder) -> Self {
        SlotAllocator {
            arena,
            order,
            cursor: 0,
            free_head: NIL,
            free_len: 0,
            outstanding: 0,
        }
    }

    /// Arena the blocks come from.
    pub fn arena(&self) -> &Arc<BlockArena> {
        &self.arena
    }

    /// Take a block. `None` when the pool is exhausted; callers back off
    /// and retry.
    pub fn alloc(&mut self) -> Option<BlockHandle> {
        let block = match self.order {
            AllocOrder::FreeListFirst => self.pop_free().or_else(|| self.carve()),
            AllocOrder::BumpFirst => self.carve().or_else(|| self.pop_free()),
        };
        match &block {
            Some(b) => {
                self.arena.set_owner(b.index(), Owner::Detached);
                self.outstanding += 1;
            }
            None => debug!(
                capacity = self.capacity(),
                outstanding = self.outstanding,
                "slot pool exhausted"
            ),
        }
        block
    }

    /// Return a block to the head of the free list.
    ///
    /// A block of another arena is refused (see [`crate::block`]).
    pub fn free(&mut self, block: BlockHandle) {
        if !self.arena.owns(block.id()) {
            foreign_block("free", block.id());
            return;
        }
        let idx = block.index();
        self.arena
            .slot(idx)
            .next
            .store(self.free_head, Ordering::Relaxed);
        self.arena.set_owner(idx, Owner::Free);
        self.free_head = idx;
        self.free_len += 1;
        self.outstanding -= 1;
    }

    /// Forget every carved block, returning to the freshly built state.
    ///
    /// Refused while any block is still handed out.
    pub fn reset(&mut self) -> Result<()> {
        if self.outstanding > 0 {
            return Err(Error::AllocatorBusy {
                outstanding: self.outstanding,
            });
        }
        for idx in 0..self.cursor {
            self.arena.set_owner(idx, Owner::Uncarved);
        }
        self.cursor = 0;
        self.free_head = NIL;
        self.free_len = 0;
        Ok(())
    }

    /// Pool size in blocks.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Blocks carved off the bump cursor so far.
    pub fn carved(&self) -> usize {
        self.cursor as usize
    }

    /// Blocks on the free list.
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Blocks handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Blocks `alloc` could still return: free list plus uncarved space.
    pub fn available(&self) -> usize {
        self.free_len + (self.capacity() - self.carved())
    }

    fn pop_free(&mut self) -> Option<BlockHandle> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.arena.slot(idx).next.load(Ordering::Relaxed);
        self.free_len -= 1;
        Some(self.arena.handle(idx))
    }

    fn carve(&mut self) -> Option<BlockHandle> {
        if self.cursor as usize >= self.capacity() {
            return None;
        }
        let idx = self.cursor;
        self.cursor += 1;
        Some(self.arena.handle(idx))
    }
}
