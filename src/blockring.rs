//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! A lock-free multi-producer multi-consumer queue that grows by splicing
//! fixed-size blocks into its ring.
//!
//! The ring is an arena of blocks addressed by index. Four monotone 64-bit
//! cursors (`count:32 | block:16 | sub:16`) track the last acquired and
//! last finished position of each side; the wrapping count field gives the
//! cursors a total order even though arena indices carry no chain order.
//! Slot traffic is pure compare-and-swap. A narrow mutex serializes the
//! rare events that change the block chain: splicing in a new block when
//! the producer would otherwise lap the consumer, and the once-per-block
//! cursor roll across a block seam.
//!
//! Each block keeps separate successor links for the producer and consumer
//! sides. A splice re-aims the producer link immediately; the consumer
//! link catches up when the consumer itself crosses the seam and consumes
//! the matching exit redirect, so in-flight takes never observe a chain
//! they did not traverse.
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[cfg(test)]
#[path = "./blockring_test.rs"]
mod blockring_test;

/// Hard limit on the number of blocks a single ring can own. At the
/// default block length this is tens of millions of in-flight items.
const MAX_BLOCKS: usize = 4096;

/// Block lengths must fit the 16-bit sub-index field of a cursor.
const MAX_BLOCK_LEN: usize = 1 << 16;

/// Marks an exit redirect slot as occupied.
const REDIRECT_VALID: u64 = 1 << 32;

fn pack(count: u32, block: usize, sub: usize) -> u64 {
    ((count as u64) << 32) | ((block as u64) << 16) | sub as u64
}

fn count_of(cursor: u64) -> u32 {
    (cursor >> 32) as u32
}

fn block_of(cursor: u64) -> usize {
    ((cursor >> 16) & 0xffff) as usize
}

fn sub_of(cursor: u64) -> usize {
    (cursor & 0xffff) as usize
}

/// `true` iff `a` is at or past `b` in the wrapping count space. Valid
/// while the two stay within `2^31` of each other, which the arena
/// capacity bounds.
fn count_reached(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

/// Advances `cursor` from `from` to `to` once every earlier finisher has
/// committed, so the cursor moves strictly in acquisition order.
fn commit(cursor: &AtomicU64, from: u64, to: u64) {
    while cursor
        .compare_exchange_weak(from, to, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        hint::spin_loop();
    }
}

/// A pending re-aim of a block's exit seam, keyed by the fill it applies
/// to. Written by a splice, consumed by the consumer crossing that exits
/// the same fill.
struct Redirect {
    /// `REDIRECT_VALID | fill_end` of the affected fill; zero when vacant.
    tag: AtomicU64,
    target: AtomicUsize,
}

impl Redirect {
    fn vacant() -> Self {
        Self {
            tag: AtomicU64::new(0),
            target: AtomicUsize::new(0),
        }
    }
}

struct Block<T> {
    slots: Box<[AtomicPtr<T>]>,

    /// Arena index of the successor block on the producer side. A splice
    /// re-aims this immediately.
    next_put: AtomicUsize,

    /// Arena index of the successor block on the consumer side. Lags
    /// `next_put` until the crossing that consumes the matching redirect
    /// syncs it.
    next_take: AtomicUsize,

    /// The take count at which the latest fill of this block is fully
    /// consumed.
    fill_end: AtomicU32,

    /// Exit redirects for fills whose successor differs from `next_take`.
    /// At most two can be outstanding: the producer re-enters a block only
    /// after the consumer finished the fill before the previous one.
    redirects: [Redirect; 2],
}

impl<T> Block<T> {
    fn new(block_len: usize, successor: usize, fill_end: u32) -> Self {
        let slots: Box<[AtomicPtr<T>]> = (0..block_len)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots,
            next_put: AtomicUsize::new(successor),
            next_take: AtomicUsize::new(successor),
            fill_end: AtomicU32::new(fill_end),
            redirects: [Redirect::vacant(), Redirect::vacant()],
        }
    }
}

/// A growing lock-free MPMC queue of boxed items.
///
/// `push` never blocks indefinitely and never fails: when the chain is
/// full it splices in a new block. `pop` never blocks: it returns `None`
/// when no published item exists. Both are safe to call from any number of
/// threads. Blocks are never reclaimed while the ring is alive.
pub struct BlockRing<T> {
    blocks: Box<[AtomicPtr<Block<T>>]>,
    num_blocks: AtomicUsize,
    grow_lock: Mutex<()>,
    block_len: usize,

    acquired_put: CachePadded<AtomicU64>,
    finished_put: CachePadded<AtomicU64>,
    acquired_take: CachePadded<AtomicU64>,
    finished_take: CachePadded<AtomicU64>,

    /// Live item count. This, not slot contents or cursor distance, is the
    /// authoritative emptiness test: a null slot read can be a bubble.
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for BlockRing<T> {}
unsafe impl<T: Send> Sync for BlockRing<T> {}

impl<T> BlockRing<T> {
    /// Construct a ring of `initial_blocks` blocks of `block_len` slots
    /// each.
    ///
    /// # Panics
    ///
    /// `block_len` must be a power of two no greater than 65536, and
    /// `initial_blocks` must be at least 3 so the producer's current
    /// block, its successor, and a splice candidate are pairwise distinct.
    pub fn new(block_len: usize, initial_blocks: usize) -> Self {
        assert!(
            block_len.is_power_of_two() && block_len <= MAX_BLOCK_LEN,
            "block length must be a power of two no greater than {}",
            MAX_BLOCK_LEN
        );
        assert!(
            initial_blocks >= 3 && initial_blocks <= MAX_BLOCKS,
            "a ring needs between 3 and {} blocks",
            MAX_BLOCKS
        );

        let blocks: Box<[AtomicPtr<Block<T>>]> = (0..MAX_BLOCKS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        for i in 0..initial_blocks {
            let block = Block::new(block_len, (i + 1) % initial_blocks, 0);
            blocks[i].store(Box::into_raw(Box::new(block)), Ordering::Relaxed);
        }

        // All cursors start on the last slot of the last block so that the
        // very first advance is an ordinary roll into block zero.
        let origin = pack(0, initial_blocks - 1, block_len - 1);

        Self {
            blocks,
            num_blocks: AtomicUsize::new(initial_blocks),
            grow_lock: Mutex::new(()),
            block_len,
            acquired_put: CachePadded::new(AtomicU64::new(origin)),
            finished_put: CachePadded::new(AtomicU64::new(origin)),
            acquired_take: CachePadded::new(AtomicU64::new(origin)),
            finished_take: CachePadded::new(AtomicU64::new(origin)),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// The number of items currently in the ring.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slot count of each block.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// The number of blocks currently in the chain. Grows over time,
    /// never shrinks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks.load(Ordering::Acquire)
    }

    fn block(&self, index: usize) -> &Block<T> {
        let ptr = self.blocks[index].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    /// Append `value` to the ring.
    pub fn push(&self, value: T) {
        let item = Box::into_raw(Box::new(value));
        loop {
            let cur = self.acquired_put.load(Ordering::Acquire);
            let (count, block_idx, sub) = (count_of(cur), block_of(cur), sub_of(cur));
            let block = self.block(block_idx);

            if sub + 1 < self.block_len {
                let next = pack(count.wrapping_add(1), block_idx, sub + 1);
                if self
                    .acquired_put
                    .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                self.publish(&block.slots[sub + 1], item, cur, next);
                return;
            }

            // Block seam. Crossings synchronize with growth so a roll and
            // a splice over the same seam cannot interleave.
            let guard = self.grow_lock.lock();
            if self.acquired_put.load(Ordering::Relaxed) != cur {
                continue;
            }
            let target_idx = block.next_put.load(Ordering::Relaxed);
            let target = self.block(target_idx);
            let drained = count_reached(
                count_of(self.finished_take.load(Ordering::Acquire)),
                target.fill_end.load(Ordering::Relaxed),
            );
            if drained {
                let next = pack(count.wrapping_add(1), target_idx, 0);
                if self
                    .acquired_put
                    .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                // The new fill of `target` ends `block_len` advances after
                // the seam.
                target
                    .fill_end
                    .store(count.wrapping_add(self.block_len as u32), Ordering::Relaxed);
                drop(guard);
                self.publish(&target.slots[0], item, cur, next);
                return;
            }

            // The chain is full up to the consumer: splice a fresh block
            // between `block` and `target`, then retry. Losers of the lock
            // race revalidate and roll into the block the winner added.
            self.splice(block, count, target_idx);
        }
    }

    /// Remove and return the oldest item, or `None` if the ring holds no
    /// published item.
    pub fn pop(&self) -> Option<T> {
        loop {
            if self.len.load(Ordering::Acquire) == 0 {
                return None;
            }
            let cur = self.acquired_take.load(Ordering::Acquire);
            let finished_put = self.finished_put.load(Ordering::Acquire);
            if count_of(cur) == count_of(finished_put) {
                // Nothing is published past our cursor yet.
                return None;
            }
            let (count, block_idx, sub) = (count_of(cur), block_of(cur), sub_of(cur));
            let block = self.block(block_idx);

            if sub + 1 < self.block_len {
                let next = pack(count.wrapping_add(1), block_idx, sub + 1);
                if self
                    .acquired_take
                    .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                match self.consume(&block.slots[sub + 1], cur, next) {
                    Some(value) => return Some(value),
                    None => continue,
                }
            }

            // Seam crossing: pick the successor the producer used for the
            // fill we just consumed, syncing the consumer-side link.
            let guard = self.grow_lock.lock();
            if self.acquired_take.load(Ordering::Relaxed) != cur {
                continue;
            }
            let target_idx = self.take_exit(block, count);
            let next = pack(count.wrapping_add(1), target_idx, 0);
            if self
                .acquired_take
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            drop(guard);
            let target = self.block(target_idx);
            match self.consume(&target.slots[0], cur, next) {
                Some(value) => return Some(value),
                None => continue,
            }
        }
    }

    /// Writes `item` into an owned slot and commits the finished-put
    /// cursor.
    fn publish(&self, slot: &AtomicPtr<T>, item: *mut T, cur: u64, next: u64) {
        let prev = slot.swap(item, Ordering::AcqRel);
        assert!(
            prev.is_null(),
            "occupied slot on write; ring cursors are corrupted"
        );
        self.len.fetch_add(1, Ordering::AcqRel);
        commit(&self.finished_put, cur, next);
    }

    /// Takes the item out of an owned slot and commits the finished-take
    /// cursor. Returns `None` when the slot turns out to be a bubble,
    /// which does not count against the live counter.
    fn consume(&self, slot: &AtomicPtr<T>, cur: u64, next: u64) -> Option<T> {
        let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            commit(&self.finished_take, cur, next);
            return None;
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        commit(&self.finished_take, cur, next);
        Some(*unsafe { Box::from_raw(ptr) })
    }

    /// Resolves the consumer-side successor of `block` for the fill
    /// ending at `count`, consuming the exit redirect a splice may have
    /// left for it. Must be called with the growth lock held.
    fn take_exit(&self, block: &Block<T>, count: u32) -> usize {
        let tag = REDIRECT_VALID | count as u64;
        let mut target = block.next_take.load(Ordering::Relaxed);
        for redirect in &block.redirects {
            if redirect.tag.load(Ordering::Relaxed) == tag {
                target = redirect.target.load(Ordering::Relaxed);
                redirect.tag.store(0, Ordering::Relaxed);
                break;
            }
        }
        block.next_take.store(target, Ordering::Relaxed);
        target
    }

    /// Splices a fresh block between `block` and its current successor and
    /// records the exit redirect for the fill ending at `count`. Must be
    /// called with the growth lock held.
    fn splice(&self, block: &Block<T>, count: u32, target_idx: usize) {
        let index = self.num_blocks.load(Ordering::Relaxed);
        assert!(
            index < MAX_BLOCKS,
            "block arena exhausted ({} blocks in use)",
            index
        );

        // A fresh block counts as drained as of the current take position.
        let fill_end = count_of(self.finished_take.load(Ordering::Acquire));
        let fresh = Block::new(self.block_len, target_idx, fill_end);
        self.blocks[index].store(Box::into_raw(Box::new(fresh)), Ordering::Release);
        self.num_blocks.store(index + 1, Ordering::Release);

        let tag = REDIRECT_VALID | count as u64;
        let slot = block
            .redirects
            .iter()
            .find(|r| r.tag.load(Ordering::Relaxed) == 0)
            .expect("more than two outstanding splices on one block");
        slot.target.store(index, Ordering::Relaxed);
        slot.tag.store(tag, Ordering::Relaxed);

        block.next_put.store(index, Ordering::Relaxed);
        log::debug!(
            "ring grown to {} blocks of {} slots",
            index + 1,
            self.block_len
        );
    }
}

impl<T> fmt::Debug for BlockRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRing")
            .field("block_len", &self.block_len)
            .field("num_blocks", &self.num_blocks)
            .field("len", &self.len)
            .field("acquired_put", &self.acquired_put)
            .field("finished_put", &self.finished_put)
            .field("acquired_take", &self.acquired_take)
            .field("finished_take", &self.finished_take)
            .finish()
    }
}

impl<T> Drop for BlockRing<T> {
    fn drop(&mut self) {
        for cell in self.blocks.iter() {
            let ptr = cell.swap(ptr::null_mut(), Ordering::Relaxed);
            if ptr.is_null() {
                continue;
            }
            let block = unsafe { Box::from_raw(ptr) };
            for slot in block.slots.iter() {
                let item = slot.swap(ptr::null_mut(), Ordering::Relaxed);
                if !item.is_null() {
                    drop(unsafe { Box::from_raw(item) });
                }
            }
        }
    }
}
