//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ngsdispatch::{
    BatchBarrier, CompletionTracker, Domain, Scheduler, SchedulerBuilder, WaitTimeoutError,
};

const LONG: Duration = Duration::from_secs(10);

fn build(workers: usize) -> Scheduler {
    SchedulerBuilder::new().num_workers(workers).build().unwrap()
}

/// Spin until `predicate` holds, failing the test after a generous
/// deadline.
fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + LONG;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn main_domain_runs_in_submission_order() {
    let scheduler = build(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let log = Arc::clone(&log);
        scheduler.enqueue(Domain::Main, move |_| {
            log.lock().unwrap().push(i);
        });
    }
    assert_eq!(scheduler.drain_main(), 100);
    assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn gpu_phase_never_precedes_cpu_phase() {
    const FRAMES: u64 = 5;

    let scheduler = build(2);
    let tracker = CompletionTracker::new();
    let barrier = Arc::new(BatchBarrier::new(tracker.notifier()));
    let log = Arc::new(Mutex::new(Vec::new()));

    barrier.begin_session();
    for frame in 1..=FRAMES {
        for (domain, phase) in [
            (Domain::AfterCpuFrame, "cpu"),
            (Domain::AfterGpuFrame, "gpu"),
        ]
        .iter()
        .cloned()
        {
            let log = Arc::clone(&log);
            scheduler.enqueue(
                domain,
                BatchBarrier::attach(&barrier, move |_| {
                    log.lock().unwrap().push((phase, frame));
                }),
            );
        }
        scheduler.notify_cpu_frame_end(frame);
        scheduler.notify_gpu_frame_end(frame);
    }
    barrier.finish_session();
    tracker.wait();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2 * FRAMES as usize);
    for frame in 1..=FRAMES {
        let cpu_at = log.iter().position(|&e| e == ("cpu", frame)).unwrap();
        let gpu_at = log.iter().position(|&e| e == ("gpu", frame)).unwrap();
        assert!(
            cpu_at < gpu_at,
            "frame {}: gpu phase ran at {} before cpu phase at {}",
            frame,
            gpu_at,
            cpu_at
        );
    }
}

#[test]
fn gpu_signals_ahead_of_cpu_are_held_back() {
    let scheduler = build(1);
    let (tx, rx) = mpsc::channel();

    scheduler.enqueue(Domain::AfterGpuFrame, move |_| {
        tx.send(()).unwrap();
    });

    // The GPU can race several frames ahead; none of them release the
    // item while the CPU side of frame 1 is unfinished.
    scheduler.notify_gpu_frame_end(1);
    scheduler.notify_gpu_frame_end(2);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    scheduler.notify_cpu_frame_end(1);
    rx.recv_timeout(LONG).unwrap();
}

#[test]
fn deferred_items_track_the_current_frame() {
    let scheduler = build(1);
    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    // Enqueued while frame 1 is being built.
    scheduler.enqueue(Domain::AfterCpuFrame, move |_| {
        tx1.send(()).unwrap();
    });
    scheduler.notify_cpu_frame_end(1);
    rx1.recv_timeout(LONG).unwrap();

    // Enqueued while frame 2 is being built; the frame 1 signal is
    // already in the past.
    scheduler.enqueue(Domain::AfterCpuFrame, move |_| {
        tx2.send(()).unwrap();
    });
    assert!(rx2.recv_timeout(Duration::from_millis(200)).is_err());
    scheduler.notify_cpu_frame_end(2);
    rx2.recv_timeout(LONG).unwrap();
}

#[test]
fn worker_ids_identify_the_executing_domain() {
    let scheduler = build(2);
    let tracker = CompletionTracker::new();
    let barrier = Arc::new(BatchBarrier::new(tracker.notifier()));
    let workers = scheduler.num_workers();

    barrier.begin_session();
    for _ in 0..50 {
        scheduler.enqueue(
            Domain::Background,
            BatchBarrier::attach(&barrier, move |worker| {
                assert!(worker.index() < workers);
            }),
        );
    }
    scheduler.enqueue(
        Domain::AfterCpuFrame,
        BatchBarrier::attach(&barrier, move |worker| {
            assert_eq!(worker.index(), workers + 1);
        }),
    );
    barrier.finish_session();

    scheduler.notify_cpu_frame_end(1);
    tracker.wait();

    let (tx, rx) = mpsc::channel();
    scheduler.enqueue(Domain::Main, move |worker| {
        tx.send(worker.index()).unwrap();
    });
    scheduler.drain_main();
    assert_eq!(rx.recv_timeout(LONG).unwrap(), workers);
}

#[test]
fn stuck_batch_times_out_then_completes() {
    let tracker = CompletionTracker::new();
    let barrier = Arc::new(BatchBarrier::new(tracker.notifier()));

    barrier.begin_session();
    barrier.add_one();
    barrier.finish_session();

    assert_eq!(
        tracker.wait_timeout(Duration::from_millis(100)),
        Err(WaitTimeoutError::Timeout)
    );

    barrier.complete_one();
    assert_eq!(tracker.wait_timeout(LONG), Ok(()));
    assert!(tracker.is_completed());
}

#[test]
fn jobs_can_enqueue_more_jobs() {
    const SEEDS: usize = 20;

    let scheduler = Arc::new(build(2));
    let ran = Arc::new(AtomicUsize::new(0));

    // Each background job spawns a follow-up background job; both
    // generations must complete before the pool goes idle.
    for _ in 0..SEEDS {
        let scheduler2 = Arc::clone(&scheduler);
        let ran2 = Arc::clone(&ran);
        scheduler.enqueue(Domain::Background, move |_| {
            let ran3 = Arc::clone(&ran2);
            scheduler2.enqueue(Domain::Background, move |_| {
                ran3.fetch_add(1, Ordering::SeqCst);
            });
            ran2.fetch_add(1, Ordering::SeqCst);
        });
    }

    wait_until(|| ran.load(Ordering::SeqCst) == 2 * SEEDS);
    wait_until(|| scheduler.is_idle(Domain::Background));
}

#[test]
fn scopes_hold_off_idleness_during_a_burst() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 100;

    let scheduler = Arc::new(build(2));
    let ran = Arc::new(AtomicUsize::new(0));

    let scope = scheduler.begin_enqueueing(Domain::Background);
    assert!(!scheduler.is_idle(Domain::Background));

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let ran = Arc::clone(&ran);
                    scheduler.enqueue(Domain::Background, move |_| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    // However fast the workers drain, the open scope keeps the domain
    // busy for the whole burst.
    assert!(!scheduler.is_idle(Domain::Background));
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!scheduler.is_idle(Domain::Background));
    scope.end();

    wait_until(|| scheduler.is_idle(Domain::Background));
    assert_eq!(ran.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
}

#[test]
fn independent_schedulers_do_not_interfere() {
    let a = build(1);
    let b = build(2);
    let ran_a = Arc::new(AtomicUsize::new(0));
    let ran_b = Arc::new(AtomicUsize::new(0));

    // Frame clocks are per scheduler, not process state.
    a.notify_cpu_frame_end(1);
    a.notify_cpu_frame_end(2);
    b.notify_cpu_frame_end(1);

    {
        let ran_a = Arc::clone(&ran_a);
        a.enqueue(Domain::AfterCpuFrame, move |_| {
            ran_a.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let ran_b = Arc::clone(&ran_b);
        b.enqueue(Domain::AfterCpuFrame, move |_| {
            ran_b.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.notify_cpu_frame_end(3);
    b.notify_cpu_frame_end(2);
    wait_until(|| ran_a.load(Ordering::SeqCst) == 1);
    wait_until(|| ran_b.load(Ordering::SeqCst) == 1);

    drop(a);
    let ran_b2 = Arc::clone(&ran_b);
    b.enqueue(Domain::Background, move |_| {
        ran_b2.fetch_add(1, Ordering::SeqCst);
    });
    wait_until(|| ran_b.load(Ordering::SeqCst) == 2);
}
