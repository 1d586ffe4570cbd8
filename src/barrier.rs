//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Fan-out/fan-in completion tracking for batches of dispatched work.
//!
//! A [`BatchBarrier`] counts the outstanding items of one batch at a time
//! and runs a callback exactly once when the batch drains. Sessions keep
//! the count pinned above zero while items are still being added, so a
//! batch whose items all finish before the producer is done adding cannot
//! fire early.
//!
//! [`CompletionTracker`] is the blocking front-end: it converts the
//! callback into something a thread can `wait` on.
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::job::WorkerId;

#[cfg(test)]
#[path = "./barrier_test.rs"]
mod barrier_test;

/// Tracks one batch of work items at a time and reports when the batch
/// has fully drained.
///
/// A batch is bracketed by [`begin_session`](BatchBarrier::begin_session)
/// and [`finish_session`](BatchBarrier::finish_session). Between the two,
/// every item is announced with [`add_one`](BatchBarrier::add_one) (or
/// [`attach`](BatchBarrier::attach)) and retired with
/// [`complete_one`](BatchBarrier::complete_one). The drain callback runs
/// exactly once per session, on whichever thread retires the last unit;
/// the session itself counts as a unit, so the callback never runs while
/// the producer might still add items.
pub struct BatchBarrier {
    /// Items in flight plus one virtual unit per open session.
    outstanding: AtomicIsize,

    /// Number of sessions begun.
    generation: AtomicU64,

    /// Number of sessions whose drain callback has run.
    fired: AtomicU64,

    on_drained: Box<dyn Fn() + Send + Sync>,
}

impl BatchBarrier {
    /// Construct a barrier whose batches report their drain by calling
    /// `on_drained`.
    pub fn new<F>(on_drained: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            outstanding: AtomicIsize::new(0),
            generation: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            on_drained: Box::new(on_drained),
        }
    }

    /// Open a session for a new batch.
    ///
    /// # Panics
    ///
    /// The previous session must have drained completely.
    pub fn begin_session(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        assert_eq!(
            self.fired.load(Ordering::Acquire),
            generation,
            "barrier session began before the previous one drained"
        );
        let prev = self.outstanding.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0);
        self.generation.store(generation + 1, Ordering::Release);
    }

    /// Announce one item of the current batch.
    ///
    /// # Panics
    ///
    /// A session must be open.
    pub fn add_one(&self) {
        let prev = self.outstanding.fetch_add(1, Ordering::AcqRel);
        assert!(prev >= 1, "barrier item added outside a session");
    }

    /// Retire one item of the current batch.
    ///
    /// # Panics
    ///
    /// Every retirement must match an earlier `add_one`.
    pub fn complete_one(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "barrier completion without a matching add");
        if prev == 1 {
            self.fire();
        }
    }

    /// Close the current session. Once all of its items are retired (which
    /// may already be the case) the drain callback runs.
    ///
    /// # Panics
    ///
    /// The session must be open.
    pub fn finish_session(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "barrier session finished twice");
        if prev == 1 {
            self.fire();
        }
    }

    /// Announce one item and wrap `work` so that running it retires the
    /// item afterwards.
    pub fn attach<F>(this: &Arc<Self>, work: F) -> impl FnOnce(WorkerId) + Send + 'static
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        this.add_one();
        let barrier = Arc::clone(this);
        move |worker| {
            work(worker);
            barrier.complete_one();
        }
    }

    /// `true` iff no session is open and the last one has drained.
    pub fn is_drained(&self) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        self.fired.load(Ordering::Acquire) == generation
    }

    /// Runs the callback for the current generation unless another thread
    /// already did. The retirement that zeroes the count and the session
    /// closure can race here; the generation CAS picks a single winner.
    fn fire(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self
            .fired
            .compare_exchange(
                generation - 1,
                generation,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            (self.on_drained)();
        }
    }
}

impl fmt::Debug for BatchBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBarrier")
            .field("outstanding", &self.outstanding)
            .field("generation", &self.generation)
            .field("fired", &self.fired)
            .finish()
    }
}

/// An error returned by [`CompletionTracker::wait_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTimeoutError {
    Timeout,
}

#[derive(Debug)]
struct TrackerState {
    completed: Mutex<bool>,
    cv: Condvar,
}

/// Tracks a single completion event and provides a method to wait for it.
///
/// The tracker hands out a [`notifier`](CompletionTracker::notifier)
/// closure meant to serve as a [`BatchBarrier`] drain callback; any
/// thread can then block until the notifier has run. A tracker observes
/// one event only; a later batch takes a fresh tracker.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    state: Arc<TrackerState>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TrackerState {
                completed: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// A closure that marks the tracker completed and wakes all waiters.
    pub fn notifier(&self) -> impl Fn() + Send + Sync + 'static {
        let state = Arc::clone(&self.state);
        move || {
            let mut completed = state.completed.lock();
            *completed = true;
            state.cv.notify_all();
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.state.completed.lock()
    }

    /// Block until the notifier has run.
    pub fn wait(&self) {
        let mut completed = self.state.completed.lock();
        while !*completed {
            self.state.cv.wait(&mut completed);
        }
    }

    /// Block until the notifier has run or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut completed = self.state.completed.lock();
        while !*completed {
            if self
                .state
                .cv
                .wait_until(&mut completed, deadline)
                .timed_out()
            {
                // The notifier may have slipped in between the deadline
                // and the lock reacquisition.
                return if *completed {
                    Ok(())
                } else {
                    Err(WaitTimeoutError::Timeout)
                };
            }
        }
        Ok(())
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}
