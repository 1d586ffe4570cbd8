//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Work items and the identity of the threads that execute them.

/// A unit of work accepted by the dispatcher.
///
/// A job is owned by a ring slot from the moment it is enqueued until the
/// moment it is dequeued, at which point ownership moves to the executing
/// thread. Being `FnOnce`, a job runs at most once by construction;
/// re-submission requires constructing a new closure.
pub(crate) type Job = Box<dyn FnOnce(WorkerId) + Send + 'static>;

/// Identifies the thread a job is running on.
///
/// Background workers are numbered `0..num_workers`. The main thread is
/// `num_workers`, and the frame phase driver is `num_workers + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    /// Get the index of the executing thread.
    pub fn index(self) -> usize {
        self.0
    }
}
