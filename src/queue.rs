//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Work queue domains.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::blockring::BlockRing;
use crate::job::Job;
use crate::lapring::LapRing;

/// The block length of the immediate domains' rings.
pub(crate) const DEFAULT_BLOCK_LEN: usize = 8192;

/// The immediate domains' rings start with the minimum block count and
/// grow on demand.
pub(crate) const INITIAL_BLOCKS: usize = 3;

/// The execution domain of a dispatched work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Runs on the thread that built the scheduler, when that thread
    /// polls. Items run in submission order.
    Main,

    /// Runs on the background worker pool as soon as a worker is free.
    /// Dequeue order is FIFO; completion order across workers is not
    /// specified.
    Background,

    /// Held back until the CPU side of the item's frame has been
    /// announced as finished.
    AfterCpuFrame,

    /// Held back until both the CPU and the GPU side of the item's frame
    /// have been announced as finished.
    AfterGpuFrame,
}

/// A work item parked in a deferred domain, tagged with the frame whose
/// completion releases it.
pub(crate) struct DeferredJob {
    pub frame: u64,
    pub job: Job,
}

/// Backing state of an immediate domain: an unbounded ring plus the
/// open-scope count that distinguishes "momentarily empty" from "the
/// producers are done".
pub(crate) struct ImmediateQueue {
    ring: BlockRing<Job>,
    open_scopes: AtomicUsize,
}

impl ImmediateQueue {
    pub fn new() -> Self {
        Self {
            ring: BlockRing::new(DEFAULT_BLOCK_LEN, INITIAL_BLOCKS),
            open_scopes: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, job: Job) {
        self.ring.push(job);
    }

    pub fn pop(&self) -> Option<Job> {
        self.ring.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn open_scope(&self) {
        self.open_scopes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn close_scope(&self) {
        let prev = self.open_scopes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
    }

    /// Empty with no enqueueing scope open.
    pub fn is_idle(&self) -> bool {
        self.open_scopes.load(Ordering::Acquire) == 0 && self.ring.is_empty()
    }
}

/// Backing state of a deferred domain. The ring is bounded: deferred
/// items accumulate for at most a frame or two before the driver drains
/// them, so the capacity is a hard bound the host picks at build time.
pub(crate) struct DeferredQueue {
    ring: LapRing<DeferredJob>,
    open_scopes: AtomicUsize,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: LapRing::new(capacity),
            open_scopes: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, frame: u64, job: Job) {
        self.ring.push(DeferredJob { frame, job });
    }

    /// Take the next item whose frame is at or below `ceiling`. Producers
    /// tag items from a monotone frame counter, so the ring is in frame
    /// order up to enqueue races that invert adjacent frames; the ceiling
    /// only rises, so checking the head cannot strand an item for more
    /// than a frame.
    pub fn pop_ready(&self, ceiling: u64) -> Option<Job> {
        self.ring.pop_if(|item| item.frame <= ceiling).map(|item| item.job)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn open_scope(&self) {
        self.open_scopes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn close_scope(&self) {
        let prev = self.open_scopes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
    }

    pub fn is_idle(&self) -> bool {
        self.open_scopes.load(Ordering::Acquire) == 0 && self.ring.is_empty()
    }
}
