//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Frame-phased concurrent work dispatching for the Nightingales engine.
//!
//! Work items are `FnOnce` closures handed to one of four execution
//! domains on a [`Scheduler`]: the main thread (run when it polls), a
//! background worker pool (run as soon as a worker is free), and two
//! deferred domains whose items are held back until the engine's frame
//! pipeline reports the matching boundary (CPU side done, or CPU and GPU
//! sides done). Queues are lock-free rings; fan-out/fan-in completion of
//! a batch is tracked by [`BatchBarrier`] and awaited through
//! [`CompletionTracker`].
//!
//! ```
//! use ngsdispatch::{Domain, SchedulerBuilder};
//!
//! let scheduler = SchedulerBuilder::new().num_workers(2).build().unwrap();
//!
//! // Runs on a background worker as soon as one is free.
//! scheduler.enqueue(Domain::Background, |_| { /* ... */ });
//!
//! // Runs when the owning thread polls.
//! scheduler.enqueue(Domain::Main, |_| { /* ... */ });
//! scheduler.drain_main();
//!
//! // Held back until frame 1 is reported finished on the CPU side.
//! scheduler.enqueue(Domain::AfterCpuFrame, |_| { /* ... */ });
//! scheduler.notify_cpu_frame_end(1);
//! ```
mod barrier;
mod blockring;
mod error;
mod frame;
mod job;
mod lapring;
mod queue;
mod scheduler;

pub use crate::barrier::*;
pub use crate::blockring::*;
pub use crate::error::*;
pub use crate::job::*;
pub use crate::lapring::*;
pub use crate::queue::*;
pub use crate::scheduler::*;
