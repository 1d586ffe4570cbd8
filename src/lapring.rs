//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! A bounded multi-producer multi-consumer ring with per-slot lap
//! versions.
//!
//! Every slot carries a version counter that advances by two each time
//! the ring laps it: an even value `2·lap` means the slot is ready to be
//! written on that lap, the odd value `2·lap + 1` means it holds data
//! ready to be read. Producers claim positions with a fetch-add and wait
//! for their slot's write version; consumers commit the head position
//! with a compare-and-swap, so a consumer never waits.
//!
//! [`LapRing::pop_if`] additionally lets a consumer inspect the head item
//! in place and decline it, which is how deferred work is held back until
//! its frame comes up.
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
#[path = "./lapring_test.rs"]
mod lapring_test;

/// Set on the pop position while a `pop_if` holds the head pinned for
/// inspection.
const RESERVED: u64 = 1 << 63;

struct Slot<T> {
    version: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity MPMC ring of `T`.
///
/// `push` spins when the ring is full, so size the ring for the peak
/// backlog of the workload. `pop` and `pop_if` never block.
pub struct LapRing<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    shift: u32,
    push_pos: CachePadded<AtomicU64>,
    pop_pos: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for LapRing<T> {}
unsafe impl<T: Send> Sync for LapRing<T> {}

impl<T> LapRing<T> {
    /// Construct a ring with room for `capacity` items.
    ///
    /// # Panics
    ///
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && (capacity as u64) <= 1 << 32,
            "ring capacity must be a power of two no greater than 2^32"
        );
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|_| Slot {
                version: AtomicU64::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            shift: capacity.trailing_zeros(),
            push_pos: CachePadded::new(AtomicU64::new(0)),
            pop_pos: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The approximate number of items in the ring. Exact while no other
    /// thread is mid-operation.
    pub fn len(&self) -> usize {
        let push = self.push_pos.load(Ordering::Acquire);
        let pop = self.pop_pos.load(Ordering::Acquire) & !RESERVED;
        push.saturating_sub(pop) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `value`, spinning while the ring is full.
    pub fn push(&self, value: T) {
        let pos = self.push_pos.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];
        let writable = (pos >> self.shift) * 2;
        while slot.version.load(Ordering::Acquire) != writable {
            hint::spin_loop();
        }
        unsafe { (*slot.value.get()).write(value) };
        slot.version.store(writable + 1, Ordering::Release);
    }

    /// Remove and return the head item, or `None` if the ring is empty,
    /// the head item is not yet published, or another consumer got there
    /// first.
    pub fn pop(&self) -> Option<T> {
        let pos = self.pop_pos.load(Ordering::Acquire);
        if pos & RESERVED != 0 {
            return None;
        }
        let slot = &self.slots[(pos & self.mask) as usize];
        let readable = (pos >> self.shift) * 2 + 1;
        if slot.version.load(Ordering::Acquire) != readable {
            return None;
        }
        if self
            .pop_pos
            .compare_exchange(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let value = unsafe { (*slot.value.get()).as_ptr().read() };
        slot.version.store(readable + 1, Ordering::Release);
        Some(value)
    }

    /// Remove and return the head item if `predicate` accepts it.
    ///
    /// The head is pinned while the predicate runs; `pop` and `pop_if`
    /// calls on other threads return `None` in the meantime. A declined
    /// item stays at the head of the ring.
    pub fn pop_if<F>(&self, predicate: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let pos = self.pop_pos.load(Ordering::Acquire);
        if pos & RESERVED != 0 {
            return None;
        }
        let slot = &self.slots[(pos & self.mask) as usize];
        let readable = (pos >> self.shift) * 2 + 1;
        if slot.version.load(Ordering::Acquire) != readable {
            return None;
        }
        if self
            .pop_pos
            .compare_exchange(pos, pos | RESERVED, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // We pinned the head, so the slot cannot change under us.
        if predicate(unsafe { &*(*slot.value.get()).as_ptr() }) {
            let value = unsafe { (*slot.value.get()).as_ptr().read() };
            slot.version.store(readable + 1, Ordering::Release);
            self.pop_pos.store(pos + 1, Ordering::Release);
            Some(value)
        } else {
            self.pop_pos.store(pos, Ordering::Release);
            None
        }
    }
}

impl<T> fmt::Debug for LapRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapRing")
            .field("capacity", &self.slots.len())
            .field("push_pos", &self.push_pos)
            .field("pop_pos", &self.pop_pos)
            .finish()
    }
}

impl<T> Drop for LapRing<T> {
    fn drop(&mut self) {
        let push = *self.push_pos.get_mut();
        let pop = *self.pop_pos.get_mut() & !RESERVED;
        for pos in pop..push {
            let readable = (pos >> self.shift) * 2 + 1;
            let slot = &mut self.slots[(pos & self.mask) as usize];
            if *slot.version.get_mut() == readable {
                unsafe { ptr::drop_in_place((*slot.value.get()).as_mut_ptr()) };
            }
        }
    }
}
