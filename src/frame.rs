//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Frame-boundary tracking and the driver thread of the deferred
//! domains.
//!
//! The host announces two kinds of frame boundaries: the CPU side of a
//! frame being done, and the GPU side (presentation included) being
//! done. The driver thread parks until one of those signals arrives and
//! then releases every deferred item whose frame has passed the relevant
//! boundary.
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::job::WorkerId;
use crate::scheduler::Shared;

/// Upper bound on how long the driver sleeps without an explicit wake.
/// An enqueue can race past a signal it should have been released by;
/// the nap bounds how long such an item sits.
const DRIVER_NAP: Duration = Duration::from_millis(100);

/// The frame counters advanced by the host's boundary signals, plus the
/// wait state of the driver thread.
pub(crate) struct FrameClock {
    cpu: AtomicU64,
    gpu: AtomicU64,
    lock: Mutex<()>,
    wakeups: Condvar,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            cpu: AtomicU64::new(0),
            gpu: AtomicU64::new(0),
            lock: Mutex::new(()),
            wakeups: Condvar::new(),
        }
    }

    /// The latest CPU frame announced as done; zero before the first.
    pub fn cpu_frame(&self) -> u64 {
        self.cpu.load(Ordering::Acquire)
    }

    /// The latest GPU frame announced as done; zero before the first.
    pub fn gpu_frame(&self) -> u64 {
        self.gpu.load(Ordering::Acquire)
    }

    pub fn advance_cpu(&self, frame: u64) {
        Self::advance(&self.cpu, frame, "CPU");
        self.wake();
    }

    pub fn advance_gpu(&self, frame: u64) {
        Self::advance(&self.gpu, frame, "GPU");
        self.wake();
    }

    /// Frame numbers are one-based and dense; anything else is a host
    /// bug.
    fn advance(counter: &AtomicU64, frame: u64, which: &str) {
        assert!(frame >= 1, "frame numbers start at 1");
        if let Err(current) =
            counter.compare_exchange(frame - 1, frame, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!(
                "{} frame {} was signaled while the last finished frame is {}",
                which, frame, current
            );
        }
    }

    /// Wake the driver so it re-reads the counters.
    pub fn wake(&self) {
        drop(self.lock.lock());
        self.wakeups.notify_all();
    }
}

/// Body of the frame driver thread.
pub(crate) fn driver_main(shared: &Shared, worker: WorkerId) {
    log::trace!("frame driver up");
    loop {
        let cpu = shared.clock.cpu_frame();
        let gpu = shared.clock.gpu_frame();

        let mut ran = 0usize;
        while let Some(job) = shared.after_cpu.pop_ready(cpu) {
            job(worker);
            ran += 1;
        }
        // Work behind a GPU boundary must never outrun the matching CPU
        // boundary, so the ceiling is the lower of the two signals.
        let ceiling = cpu.min(gpu);
        while let Some(job) = shared.after_gpu.pop_ready(ceiling) {
            job(worker);
            ran += 1;
        }
        if ran != 0 {
            log::trace!("ran {} deferred items (cpu {}, gpu {})", ran, cpu, gpu);
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        // Another signal may have landed while we were draining.
        if shared.clock.cpu_frame() != cpu || shared.clock.gpu_frame() != gpu {
            continue;
        }
        let mut guard = shared.clock.lock.lock();
        if shared.shutdown.load(Ordering::Acquire)
            || shared.clock.cpu_frame() != cpu
            || shared.clock.gpu_frame() != gpu
        {
            continue;
        }
        let _ = shared.clock.wakeups.wait_for(&mut guard, DRIVER_NAP);
    }
    log::trace!("frame driver exiting");
}
