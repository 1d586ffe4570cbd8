//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! The frame-phased work scheduler.
//!
//! A [`Scheduler`] owns four work queue domains (see [`Domain`]) and the
//! threads that consume them: a pool of background workers and a frame
//! driver, both spawned at build time and joined on drop. The thread
//! that builds the scheduler becomes its main thread; main-domain items
//! run only when that thread calls [`poll_main`](Scheduler::poll_main)
//! or [`drain_main`](Scheduler::drain_main).
//!
//! All state hangs off the `Scheduler` value. Hosts that want several
//! independent dispatch worlds (tests do) simply build several.
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, ErrorKind, Result};
use crate::frame::{self, FrameClock};
use crate::job::{Job, WorkerId};
use crate::queue::{DeferredQueue, Domain, ImmediateQueue};

#[cfg(test)]
#[path = "./scheduler_test.rs"]
mod scheduler_test;

/// Sleep/wake state of the background worker pool.
pub(crate) struct PoolState {
    lock: Mutex<()>,
    wakeups: Condvar,
}

impl PoolState {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            wakeups: Condvar::new(),
        }
    }

    /// The lock bracket pairs with the recheck a worker does before
    /// waiting, so a wake cannot fall into that window unseen.
    pub fn wake_one(&self) {
        drop(self.lock.lock());
        self.wakeups.notify_one();
    }

    pub fn wake_all(&self) {
        drop(self.lock.lock());
        self.wakeups.notify_all();
    }
}

/// State shared between the `Scheduler` handle and its threads.
pub(crate) struct Shared {
    pub main: ImmediateQueue,
    pub background: ImmediateQueue,
    pub after_cpu: DeferredQueue,
    pub after_gpu: DeferredQueue,
    pub clock: FrameClock,
    pub pool: PoolState,
    pub shutdown: AtomicBool,
    pub num_workers: usize,
}

fn worker_main(shared: &Shared, worker: WorkerId) {
    log::trace!("worker {} up", worker.index());
    loop {
        while let Some(job) = shared.background.pop() {
            job(worker);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut guard = shared.pool.lock.lock();
        if !shared.background.is_empty() || shared.shutdown.load(Ordering::Acquire) {
            continue;
        }
        shared.pool.wakeups.wait(&mut guard);
    }
    log::trace!("worker {} exiting", worker.index());
}

/// Constructs a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    num_workers: usize,
    deferred_capacity: usize,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            num_workers: 1,
            deferred_capacity: 512,
        }
    }

    /// Set the number of background worker threads. Defaults to `1`.
    pub fn num_workers(&mut self, count: usize) -> &mut Self {
        self.num_workers = count;
        self
    }

    /// Set the capacity of each deferred domain's ring. Must be a power
    /// of two. Defaults to `512`.
    pub fn deferred_capacity(&mut self, capacity: usize) -> &mut Self {
        self.deferred_capacity = capacity;
        self
    }

    /// Spawn the worker and driver threads and return the scheduler. The
    /// calling thread becomes the scheduler's main thread.
    pub fn build(&mut self) -> Result<Scheduler> {
        if self.num_workers == 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidUsage,
                "worker count must be nonzero",
            ));
        }
        if !self.deferred_capacity.is_power_of_two() {
            return Err(Error::with_detail(
                ErrorKind::InvalidUsage,
                "deferred capacity must be a nonzero power of two",
            ));
        }

        let shared = Arc::new(Shared {
            main: ImmediateQueue::new(),
            background: ImmediateQueue::new(),
            after_cpu: DeferredQueue::new(self.deferred_capacity),
            after_gpu: DeferredQueue::new(self.deferred_capacity),
            clock: FrameClock::new(),
            pool: PoolState::new(),
            shutdown: AtomicBool::new(false),
            num_workers: self.num_workers,
        });

        // If a later spawn fails, dropping the partially built scheduler
        // shuts down and joins the threads spawned so far.
        let mut scheduler = Scheduler {
            shared,
            threads: Vec::with_capacity(self.num_workers + 1),
            main_thread: thread::current().id(),
        };
        for i in 0..self.num_workers {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!("ngsdispatch-worker-{}", i))
                .spawn(move || worker_main(&shared, WorkerId(i)))
                .map_err(|e| Error::with_detail(ErrorKind::Other, e))?;
            scheduler.threads.push(handle);
        }
        let shared = Arc::clone(&scheduler.shared);
        let driver_worker = WorkerId(self.num_workers + 1);
        let handle = thread::Builder::new()
            .name("ngsdispatch-frame".to_owned())
            .spawn(move || frame::driver_main(&shared, driver_worker))
            .map_err(|e| Error::with_detail(ErrorKind::Other, e))?;
        scheduler.threads.push(handle);

        log::debug!("scheduler up with {} workers", self.num_workers);
        Ok(scheduler)
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame-phased work scheduler. See the module documentation.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
    main_thread: thread::ThreadId,
}

impl Scheduler {
    /// Hand `work` to `domain`. Callable from any thread.
    pub fn enqueue<F>(&self, domain: Domain, work: F)
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        self.enqueue_boxed(domain, Box::new(work));
    }

    fn enqueue_boxed(&self, domain: Domain, job: Job) {
        match domain {
            Domain::Main => self.shared.main.push(job),
            Domain::Background => {
                self.shared.background.push(job);
                self.shared.pool.wake_one();
            }
            // Deferred items belong to the frame under construction, the
            // successor of the last finished CPU frame.
            Domain::AfterCpuFrame => {
                let frame = self.shared.clock.cpu_frame() + 1;
                self.shared.after_cpu.push(frame, job);
            }
            Domain::AfterGpuFrame => {
                let frame = self.shared.clock.cpu_frame() + 1;
                self.shared.after_gpu.push(frame, job);
            }
        }
    }

    /// Open an enqueueing scope on `domain`. While any scope is open the
    /// domain does not report idle, even when its queue is momentarily
    /// empty.
    pub fn begin_enqueueing(&self, domain: Domain) -> EnqueueScope<'_> {
        match domain {
            Domain::Main => self.shared.main.open_scope(),
            Domain::Background => self.shared.background.open_scope(),
            Domain::AfterCpuFrame => self.shared.after_cpu.open_scope(),
            Domain::AfterGpuFrame => self.shared.after_gpu.open_scope(),
        }
        EnqueueScope {
            scheduler: self,
            domain,
        }
    }

    /// Run one pending main-domain item, if any. Returns whether one ran.
    ///
    /// Must be called on the thread that built the scheduler.
    pub fn poll_main(&self) -> bool {
        debug_assert_eq!(
            thread::current().id(),
            self.main_thread,
            "poll_main called off the main thread"
        );
        match self.shared.main.pop() {
            Some(job) => {
                job(self.main_worker_id());
                true
            }
            None => false,
        }
    }

    /// Run main-domain items until none are pending. Returns how many
    /// ran.
    pub fn drain_main(&self) -> usize {
        let mut ran = 0;
        while self.poll_main() {
            ran += 1;
        }
        ran
    }

    /// Announce that the CPU side of `frame` is done, releasing
    /// `AfterCpuFrame` work for it.
    ///
    /// # Panics
    ///
    /// Frames are one-based; each must be announced exactly once, in
    /// order.
    pub fn notify_cpu_frame_end(&self, frame: u64) {
        self.shared.clock.advance_cpu(frame);
    }

    /// Announce that the GPU side of `frame` is done, releasing
    /// `AfterGpuFrame` work for it once the CPU side is also done.
    ///
    /// # Panics
    ///
    /// Frames are one-based; each must be announced exactly once, in
    /// order.
    pub fn notify_gpu_frame_end(&self, frame: u64) {
        self.shared.clock.advance_gpu(frame);
    }

    /// `true` iff `domain` has no queued items and no open enqueueing
    /// scope.
    pub fn is_idle(&self, domain: Domain) -> bool {
        match domain {
            Domain::Main => self.shared.main.is_idle(),
            Domain::Background => self.shared.background.is_idle(),
            Domain::AfterCpuFrame => self.shared.after_cpu.is_idle(),
            Domain::AfterGpuFrame => self.shared.after_gpu.is_idle(),
        }
    }

    /// The number of background workers.
    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// The id main-domain items run under. Workers use `0..num_workers`,
    /// the main thread `num_workers`, the frame driver `num_workers + 1`.
    pub fn main_worker_id(&self) -> WorkerId {
        WorkerId(self.shared.num_workers)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.shared.num_workers)
            .field("main_thread", &self.main_thread)
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.pool.wake_all();
        self.shared.clock.wake();
        for handle in self.threads.drain(..) {
            // Safeguard against a dispatched item dropping the scheduler
            // on one of its own threads.
            if thread::current().id() != handle.thread().id() {
                handle.join().unwrap();
            }
        }
        log::debug!("scheduler shut down");
    }
}

/// An RAII bracket around a burst of enqueues into one domain, handed
/// out by [`Scheduler::begin_enqueueing`]. Dropping it (or calling
/// [`end`](EnqueueScope::end)) closes the bracket and wakes the domain's
/// consumers so their idleness checks rerun.
///
/// When a burst is paired with a [`BatchBarrier`](crate::BatchBarrier)
/// session, close the scope before `finish_session` so the consumers are
/// already awake by the time the batch can fire.
pub struct EnqueueScope<'a> {
    scheduler: &'a Scheduler,
    domain: Domain,
}

impl EnqueueScope<'_> {
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Enqueue into the scope's domain.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        self.scheduler.enqueue(self.domain, work);
    }

    /// Close the scope. Equivalent to dropping it.
    pub fn end(self) {}
}

impl fmt::Debug for EnqueueScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueScope")
            .field("domain", &self.domain)
            .finish()
    }
}

impl Drop for EnqueueScope<'_> {
    fn drop(&mut self) {
        let shared = &self.scheduler.shared;
        match self.domain {
            Domain::Main => shared.main.close_scope(),
            Domain::Background => {
                shared.background.close_scope();
                shared.pool.wake_all();
            }
            Domain::AfterCpuFrame => {
                shared.after_cpu.close_scope();
                shared.clock.wake();
            }
            Domain::AfterGpuFrame => {
                shared.after_gpu.close_scope();
                shared.clock.wake();
            }
        }
    }
}
