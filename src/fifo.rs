//! Intrusive doubly-linked FIFO of blocks.

use std::sync::Arc;

use crate::block::{foreign_block, BlockArena, BlockHandle, BlockId, Owner, QueueTag, NIL};
use crate::sync::Ordering;

/// Queue of blocks linked through the blocks' own `prev`/`next` fields.
///
/// O(1) push, pop and arbitrary removal. No internal synchronization: wrap
/// it in a [`crate::Guarded`] and mutate it only with that lock held.
/// Popping an empty queue returns `None`; callers poll.
#[derive(Debug)]
pub struct FifoQueue {
    arena: Arc<BlockArena>,
    tag: QueueTag,
    head: u32,
    back: u32,
    count: usize,
    bytes: usize,
}

impl FifoQueue {
    /// Empty queue over `arena`.
    pub fn new(arena: Arc<BlockArena>) -> Self {
        let tag = arena.new_queue_tag();
        FifoQueue {
            arena,
            tag,
            head: NIL,
            back: NIL,
            count: 0,
            bytes: 0,
        }
    }

    /// Owner tag carried by member blocks.
    pub fn tag(&self) -> QueueTag {
        self.tag
    }

    /// Append at the back.
    pub fn push_back(&mut self, block: BlockHandle) {
        if !self.arena.owns(block.id()) {
            foreign_block("push_back", block.id());
            return;
        }
        let idx = block.index();
        let slot = self.arena.slot(idx);
        slot.next.store(NIL, Ordering::Relaxed);
        slot.prev.store(self.back, Ordering::Relaxed);

        if self.back == NIL {
            self.head = idx;
        } else {
            self.arena.slot(self.back).next.store(idx, Ordering::Relaxed);
        }
        self.back = idx;

        self.arena.set_owner(idx, Owner::Queue(self.tag));
        self.count += 1;
        self.bytes += slot.len();
        self.debug_check();
    }

    /// Detach the front block.
    pub fn pop_front(&mut self) -> Option<BlockHandle> {
        if self.head == NIL {
            return None;
        }
        Some(self.unlink(self.head))
    }

    /// Detach an arbitrary member. `None` if `id` is not in this queue.
    pub fn remove(&mut self, id: BlockId) -> Option<BlockHandle> {
        if !self.arena.owns(id) {
            foreign_block("remove", id);
            return None;
        }
        if self.arena.owner(id) != Owner::Queue(self.tag) {
            return None;
        }
        Some(self.unlink(id.index() as u32))
    }

    /// Oldest member, if any.
    pub fn front(&self) -> Option<BlockId> {
        (self.head != NIL).then(|| self.arena.block_id(self.head))
    }

    /// Member ids from front to back.
    pub fn ids(&self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(self.count);
        let mut cur = self.head;
        while cur != NIL {
            out.push(self.arena.block_id(cur));
            cur = self.arena.slot(cur).next.load(Ordering::Relaxed);
        }
        out
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the queue has no members.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of member lengths in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn unlink(&mut self, idx: u32) -> BlockHandle {
        let slot = self.arena.slot(idx);
        let prev = slot.prev.load(Ordering::Relaxed);
        let next = slot.next.load(Ordering::Relaxed);

        if prev == NIL {
            self.head = next;
        } else {
            self.arena.slot(prev).next.store(next, Ordering::Relaxed);
        }
        if next == NIL {
            self.back = prev;
        } else {
            self.arena.slot(next).prev.store(prev, Ordering::Relaxed);
        }
        slot.prev.store(NIL, Ordering::Relaxed);
        slot.next.store(NIL, Ordering::Relaxed);

        self.arena.set_owner(idx, Owner::Detached);
        self.count -= 1;
        self.bytes -= slot.len();
        self.debug_check();
        self.arena.handle(idx)
    }

    #[inline(always)]
    fn debug_check(&self) {
        debug_assert_eq!(self.count == 0, self.head == NIL);
        debug_assert_eq!(self.count == 0, self.back == NIL);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::alloc::SlotAllocator;
    use crate::block::Descriptor;
    use crate::config::AllocOrder;

    fn setup(capacity: usize) -> (SlotAllocator, FifoQueue) {
        let arena = BlockArena::new(capacity);
        (
            SlotAllocator::new(arena.clone(), AllocOrder::FreeListFirst),
            FifoQueue::new(arena),
        )
    }

    fn block(a: &mut SlotAllocator, len: usize) -> BlockHandle {
        let b = a.alloc().unwrap();
        a.arena().set_descriptor(
            &b,
            Descriptor {
                src: 0,
                tgt: 0,
                len,
            },
        );
        b
    }

    #[test]
    fn empty_pop_is_none() {
        let (_, mut q) = setup(1);
        assert!(q.pop_front().is_none());
        assert!(q.is_empty());
        assert_eq!(q.front(), None);
    }

    #[test]
    fn preserves_push_order_and_counters() {
        let (mut a, mut q) = setup(8);
        let mut ids = Vec::new();
        for len in 1..=5 {
            let b = block(&mut a, len * 10);
            ids.push(b.id());
            q.push_back(b);
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.bytes(), 150);
        assert_eq!(q.ids(), ids);

        let mut popped = Vec::new();
        while let Some(b) = q.pop_front() {
            popped.push(b.id());
            a.free(b);
        }
        assert_eq!(popped, ids);
        assert_eq!(q.bytes(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_from_middle_front_and_back() {
        let (mut a, mut q) = setup(4);
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let b = block(&mut a, i + 1);
                let id = b.id();
                q.push_back(b);
                id
            })
            .collect();

        let mid = q.remove(ids[1]).unwrap();
        assert_eq!(q.ids(), vec![ids[0], ids[2], ids[3]]);
        let back = q.remove(ids[3]).unwrap();
        let front = q.remove(ids[0]).unwrap();
        assert_eq!(q.ids(), vec![ids[2]]);
        assert_eq!(q.bytes(), 3);
        assert_eq!(q.front(), Some(ids[2]));
        for b in [mid, back, front] {
            a.free(b);
        }
    }

    #[test]
    fn remove_rejects_non_members() {
        let (mut a, mut q) = setup(2);
        let arena = a.arena().clone();
        let mut other = FifoQueue::new(arena.clone());
        let b = block(&mut a, 8);
        let id = b.id();
        other.push_back(b);
        assert!(q.remove(id).is_none());
        assert_eq!(arena.owner(id), Owner::Queue(other.tag()));
        let b = other.remove(id).unwrap();
        assert_eq!(arena.owner(id), Owner::Detached);
        a.free(b);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "another arena"))]
    fn push_back_rejects_foreign_handle() {
        let (mut a, _) = setup(2);
        let (mut b_alloc, mut b_queue) = setup(2);
        let foreign = block(&mut a, 100);
        b_queue.push_back(foreign);
        assert!(b_queue.is_empty());
        assert_eq!(b_queue.bytes(), 0);
        // The receiving pool still owns all of its own blocks.
        assert_eq!(b_alloc.available(), 2);
        let own = b_alloc.alloc().unwrap();
        assert_eq!(b_alloc.arena().owner(own.id()), Owner::Detached);
        b_alloc.free(own);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "another arena"))]
    fn remove_rejects_foreign_id() {
        let (mut a, mut a_queue) = setup(1);
        let (_, mut b_queue) = setup(1);
        let b = block(&mut a, 8);
        let id = b.id();
        a_queue.push_back(b);
        assert!(b_queue.remove(id).is_none());
        assert_eq!(a_queue.len(), 1);
    }
}
