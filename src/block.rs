//! Transfer descriptors ("blocks") living in a pre-allocated arena.
//!
//! Blocks are addressed by stable `u32` indices. A [`BlockHandle`] is the
//! owning reference: it cannot be cloned, so whoever holds it (a producer,
//! the consumer) is the block's only owner, and queues or the allocator take
//! the handle by value when they take over. The arena additionally records
//! the current owner of every block so tests can audit the hand-offs.
//!
//! Handles and ids also carry the id of the arena they came from. Passing a
//! block to an allocator or queue over a different arena panics with debug
//! assertions enabled and is a logged no-op otherwise.

use core::fmt;
use std::sync::atomic::AtomicU32 as IdCounter;
use std::sync::Arc;

use tracing::warn;

use crate::sync::{AtomicU32, AtomicUsize, Ordering};

static NEXT_ARENA_ID: IdCounter = IdCounter::new(0);

pub(crate) const NIL: u32 = u32::MAX;

const OWNER_UNCARVED: u32 = 0;
const OWNER_FREE: u32 = 1;
const OWNER_DETACHED: u32 = 2;
const FIRST_QUEUE_TAG: u32 = 3;

/// What a block describes: `len` bytes to move from `src` to `tgt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Source address.
    pub src: usize,
    /// Target address.
    pub tgt: usize,
    /// Length in bytes.
    pub len: usize,
}

/// Identity of a [`crate::FifoQueue`] inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueTag(u32);

/// Current owner of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Beyond the allocator's bump cursor; never handed out.
    Uncarved,
    /// On the allocator's free list.
    Free,
    /// Held through a [`BlockHandle`].
    Detached,
    /// Linked into the queue with this tag.
    Queue(QueueTag),
}

impl Owner {
    fn from_raw(raw: u32) -> Self {
        match raw {
            OWNER_UNCARVED => Owner::Uncarved,
            OWNER_FREE => Owner::Free,
            OWNER_DETACHED => Owner::Detached,
            tag => Owner::Queue(QueueTag(tag)),
        }
    }

    fn into_raw(self) -> u32 {
        match self {
            Owner::Uncarved => OWNER_UNCARVED,
            Owner::Free => OWNER_FREE,
            Owner::Detached => OWNER_DETACHED,
            Owner::Queue(QueueTag(tag)) => tag,
        }
    }
}

/// Non-owning name of a block, e.g. for [`crate::FifoQueue::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    arena: u32,
    idx: u32,
}

impl BlockId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.idx as usize
    }
}

/// Owning reference to a block. Move-only.
#[must_use = "a dropped handle leaks its block until the arena is dropped"]
#[derive(PartialEq, Eq)]
pub struct BlockHandle {
    arena: u32,
    idx: u32,
}

impl BlockHandle {
    pub(crate) fn index(&self) -> u32 {
        self.idx
    }

    /// Non-owning id of this block.
    pub fn id(&self) -> BlockId {
        BlockId {
            arena: self.arena,
            idx: self.idx,
        }
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHandle({}:{})", self.arena, self.idx)
    }
}

/// Policy for a block handed to an arena it does not belong to: fatal with
/// debug assertions, a logged no-op otherwise.
#[track_caller]
pub(crate) fn foreign_block(op: &'static str, id: BlockId) {
    if cfg!(debug_assertions) {
        panic!("{op}: block {} belongs to another arena ({})", id.idx, id.arena);
    }
    warn!(op, block = id.idx, arena = id.arena, "block from another arena ignored");
}

/// Links and payload fields of one block.
///
/// Every field is only touched by the block's current owner, and ownership
/// moves under a lock, so relaxed accesses suffice.
pub(crate) struct BlockSlot {
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
    owner: AtomicU32,
    seq: AtomicU32,
    src: AtomicUsize,
    tgt: AtomicUsize,
    len: AtomicUsize,
}

impl BlockSlot {
    fn new() -> Self {
        BlockSlot {
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            owner: AtomicU32::new(OWNER_UNCARVED),
            seq: AtomicU32::new(0),
            src: AtomicUsize::new(0),
            tgt: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity backing store of blocks shared by the allocator and queues.
pub struct BlockArena {
    id: u32,
    slots: Box<[BlockSlot]>,
    next_tag: AtomicU32,
}

impl BlockArena {
    /// Arena of `capacity` blocks, all uncarved.
    ///
    /// # Panics
    /// Panics if `capacity` does not fit a 32-bit index.
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(
            capacity < NIL as usize,
            "arena capacity {capacity} does not fit a 32-bit block index"
        );
        Arc::new(BlockArena {
            id: NEXT_ARENA_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            slots: (0..capacity).map(|_| BlockSlot::new()).collect(),
            next_tag: AtomicU32::new(FIRST_QUEUE_TAG),
        })
    }

    /// Number of blocks.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current owner of `id`.
    pub fn owner(&self, id: BlockId) -> Owner {
        Owner::from_raw(self.slots[id.index()].owner.load(Ordering::Relaxed))
    }

    /// Blocks currently owned by `owner`.
    pub fn count_owned_by(&self, owner: Owner) -> usize {
        let raw = owner.into_raw();
        self.slots
            .iter()
            .filter(|s| s.owner.load(Ordering::Relaxed) == raw)
            .count()
    }

    /// Payload fields of an owned block.
    pub fn descriptor(&self, block: &BlockHandle) -> Descriptor {
        let s = self.slot(block.index());
        Descriptor {
            src: s.src.load(Ordering::Relaxed),
            tgt: s.tgt.load(Ordering::Relaxed),
            len: s.len.load(Ordering::Relaxed),
        }
    }

    /// Overwrite the payload fields of an owned block.
    pub fn set_descriptor(&self, block: &BlockHandle, d: Descriptor) {
        if !self.owns(block.id()) {
            foreign_block("set_descriptor", block.id());
            return;
        }
        let s = self.slot(block.index());
        s.src.store(d.src, Ordering::Relaxed);
        s.tgt.store(d.tgt, Ordering::Relaxed);
        s.len.store(d.len, Ordering::Relaxed);
    }

    /// Sequence number stamped at transmission.
    pub fn seq(&self, block: &BlockHandle) -> u32 {
        self.slot(block.index()).seq.load(Ordering::Relaxed)
    }

    pub(crate) fn set_seq(&self, block: &BlockHandle, seq: u32) {
        self.slot(block.index()).seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn new_queue_tag(&self) -> QueueTag {
        QueueTag(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn set_owner(&self, idx: u32, owner: Owner) {
        self.slot(idx).owner.store(owner.into_raw(), Ordering::Relaxed);
    }

    /// Whether `id` names a block of this arena.
    pub fn owns(&self, id: BlockId) -> bool {
        id.arena == self.id
    }

    pub(crate) fn handle(&self, idx: u32) -> BlockHandle {
        BlockHandle { arena: self.id, idx }
    }

    pub(crate) fn block_id(&self, idx: u32) -> BlockId {
        BlockId { arena: self.id, idx }
    }

    #[inline(always)]
    pub(crate) fn slot(&self, idx: u32) -> &BlockSlot {
        &self.slots[idx as usize]
    }
}

impl fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockArena")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .finish()
    }
}
