//! Integration tests - Scheduler and completion queue end to end
//!
//! Covers submission, cooperative draining, pooled closures, worker
//! replacement, shutdown and async primitives built on completion queues.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use fos_jobs::{
    AsyncCompletionQueue, CancellationToken, ClosurePool, PendingCompletion, Scheduler,
    SchedulerConfig,
};
use parking_lot::ReentrantMutex;

// ============================================================================
// HELPERS
// ============================================================================

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::new(
        SchedulerConfig::default()
            .with_worker_threads(workers)
            .with_thread_name("fos-jobs-it"),
    )
    .unwrap()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_completed(scheduler: &Scheduler, target: u64) {
    wait_until("jobs to complete", || scheduler.completed_work() >= target);
}

fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Occupies a worker until the returned sender is dropped or used
fn block_one_worker(scheduler: &Scheduler) -> Sender<()> {
    let (open, gate): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(0);
    scheduler.submit(move || {
        let _ = gate.recv();
    });
    wait_until("the gate job to start", || scheduler.threads_busy() == 1);
    open
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[test]
fn test_four_workers_ten_thousand_jobs() {
    let scheduler = scheduler(4);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        scheduler.submit(counting_job(&counter));
    }

    wait_for_completed(&scheduler, 10_000);
    assert_eq!(scheduler.work_scheduled(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    assert_eq!(scheduler.completed_work(), 10_000);
    assert_eq!(scheduler.worker_threads_count(), 4);
}

#[test]
fn test_conservation_for_batches() {
    let scheduler = scheduler(3);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut expected = 0u64;

    for batch in [0u64, 1, 17, 500, 2_000] {
        let before = scheduler.completed_work();
        for _ in 0..batch {
            scheduler.submit(counting_job(&counter));
        }
        expected += batch;

        wait_for_completed(&scheduler, before + batch);
        assert_eq!(scheduler.completed_work(), before + batch);
        assert_eq!(counter.load(Ordering::SeqCst) as u64, expected);
    }

    wait_until("the pool to go idle", || scheduler.is_idle());
}

#[test]
fn test_repeat_count_runs_exactly_k_times() {
    let scheduler = scheduler(4);

    for k in [1usize, 2, 7, 64] {
        let counter = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&counter);
        let before = scheduler.completed_work();

        scheduler.submit_repeated(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            k,
        );

        wait_for_completed(&scheduler, before + k as u64);
        assert_eq!(counter.load(Ordering::SeqCst), k);
    }
}

#[test]
fn test_submit_does_not_block_on_saturated_pool() {
    let scheduler = scheduler(1);
    let open = block_one_worker(&scheduler);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut slowest = Duration::ZERO;
    for _ in 0..20_000 {
        let started = Instant::now();
        scheduler.submit(counting_job(&counter));
        slowest = slowest.max(started.elapsed());
    }

    assert!(
        slowest < Duration::from_millis(100),
        "slowest submit took {slowest:?}"
    );
    assert_eq!(scheduler.work_scheduled(), 20_000);

    drop(open);
    wait_for_completed(&scheduler, 20_001);
    assert_eq!(counter.load(Ordering::SeqCst), 20_000);
}

#[test]
fn test_cooperative_draining_from_foreign_thread() {
    let scheduler = Arc::new(scheduler(1));
    let open = block_one_worker(&scheduler);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        scheduler.submit(counting_job(&counter));
    }
    assert_eq!(scheduler.work_scheduled(), 5);

    let helper = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || {
            assert!(!Scheduler::is_worker_thread());

            assert!(scheduler.try_cooperate());
            assert_eq!(scheduler.work_scheduled(), 4);
            assert_eq!(scheduler.completed_work(), 1);

            while scheduler.try_cooperate() {}

            let scheduled = scheduler.work_scheduled();
            let completed = scheduler.completed_work();
            assert!(!scheduler.try_cooperate());
            assert_eq!(scheduler.work_scheduled(), scheduled);
            assert_eq!(scheduler.completed_work(), completed);
        })
    };
    helper.join().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 5);
    assert_eq!(scheduler.work_scheduled(), 0);
    assert_eq!(scheduler.completed_work(), 5);

    drop(open);
    wait_for_completed(&scheduler, 6);
}

#[test]
fn test_cooperate_propagates_job_panic_after_cleanup() {
    let scheduler = scheduler(1);
    let open = block_one_worker(&scheduler);

    scheduler.submit(|| panic!("job failed"));
    let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.try_cooperate()));

    assert!(result.is_err());
    assert_eq!(scheduler.threads_busy(), 1);
    assert_eq!(scheduler.completed_work(), 1);
    drop(open);
}

#[test]
fn test_pooled_reference_discipline() {
    let scheduler = scheduler(4);
    let pool = ClosurePool::new(|hits: &Arc<AtomicUsize>| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let hits = Arc::new(AtomicUsize::new(0));

    let job = pool.get(Arc::clone(&hits));
    let baseline = job.reference_count();
    assert_eq!(baseline, 1);

    scheduler.submit_pooled(&job, 32);
    wait_for_completed(&scheduler, 32);

    assert_eq!(hits.load(Ordering::SeqCst), 32);
    assert_eq!(job.reference_count(), baseline);

    // Releasing the caller's reference recycles the slot
    drop(job);
    assert_eq!(pool.stats().idle, 1);

    let reused = pool.get(Arc::clone(&hits));
    scheduler.submit_pooled(&reused, 4);
    wait_for_completed(&scheduler, 36);

    assert_eq!(hits.load(Ordering::SeqCst), 36);
    assert_eq!(pool.stats().reused, 1);
    assert_eq!(pool.stats().allocated, 1);
}

#[test]
fn test_pooled_closure_outlives_caller_reference() {
    let scheduler = scheduler(1);
    let open = block_one_worker(&scheduler);
    let pool = ClosurePool::new(|hits: &Arc<AtomicUsize>| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let hits = Arc::new(AtomicUsize::new(0));

    let job = pool.get(Arc::clone(&hits));
    scheduler.submit_pooled(&job, 3);
    assert_eq!(job.reference_count(), 4);

    // Queued runs keep the slot alive
    drop(job);
    assert_eq!(pool.stats().idle, 0);

    drop(open);
    wait_for_completed(&scheduler, 4);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().idle, 1);
}

#[test]
fn test_over_waking_is_harmless() {
    let scheduler = scheduler(8);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut expected = 0u64;

    for round in 0..200 {
        if round % 3 == 0 {
            let sink = Arc::clone(&counter);
            scheduler.submit_repeated(
                move || {
                    sink.fetch_add(1, Ordering::SeqCst);
                },
                3,
            );
            expected += 3;
        } else {
            scheduler.submit(counting_job(&counter));
            expected += 1;
        }

        // Let workers go back to sleep now and then
        if round % 20 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }

    wait_for_completed(&scheduler, expected);
    assert_eq!(counter.load(Ordering::SeqCst) as u64, expected);
    wait_until("the pool to go idle", || scheduler.is_idle());
}

#[test]
fn test_worker_replaced_after_panic() {
    let scheduler = scheduler(2);

    scheduler.submit(|| panic!("job failed on purpose"));
    wait_until("a worker to be replaced", || scheduler.respawned_workers() >= 1);
    assert_eq!(scheduler.worker_threads_count(), 2);

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        scheduler.submit(counting_job(&counter));
    }

    wait_for_completed(&scheduler, 101);
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn test_shutdown_runs_queued_jobs() {
    let scheduler = scheduler(1);
    let open = block_one_worker(&scheduler);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        scheduler.submit(counting_job(&counter));
    }

    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(open);
    });

    scheduler.shutdown();
    opener.join().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(scheduler.completed_work(), 11);
    assert_eq!(scheduler.work_scheduled(), 0);
}

#[test]
fn test_last_handle_dropped_inside_job() {
    let scheduler = Arc::new(scheduler(2));
    let (open, gate): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(0);
    let (done, dropped) = crossbeam_channel::bounded(1);
    let counter = Arc::new(AtomicUsize::new(0));

    let owned = Arc::clone(&scheduler);
    scheduler.submit(move || {
        let _ = gate.recv();
        drop(owned);
        let _ = done.send(());
    });
    for _ in 0..5 {
        scheduler.submit(counting_job(&counter));
    }

    drop(scheduler);
    drop(open);

    assert!(dropped.recv_timeout(Duration::from_secs(5)).is_ok());
    wait_until("queued jobs to drain", || counter.load(Ordering::SeqCst) == 5);
}

#[test]
fn test_global_scheduler_runs_jobs() {
    let scheduler = Scheduler::global();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.submit_repeated(
        {
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        },
        10,
    );

    wait_until("global jobs to run", || counter.load(Ordering::SeqCst) == 10);
}

// ============================================================================
// COMPLETION QUEUES
// ============================================================================

#[test]
fn test_job_failure_reported_through_completion() {
    let scheduler = scheduler(2);
    let results: AsyncCompletionQueue<Result<u32, String>> = AsyncCompletionQueue::new();
    let entry = results.enqueue();

    let producer = results.clone();
    scheduler.submit(move || {
        let outcome = panic::catch_unwind(|| -> u32 { panic!("parse error") })
            .map_err(|_| "job panicked".to_string());
        producer.dequeue_one(outcome).finish();
    });

    assert_eq!(entry.wait(), Ok(Err("job panicked".to_string())));
    assert_eq!(scheduler.respawned_workers(), 0);
}

#[test]
fn test_await_result_from_worker() {
    let scheduler = scheduler(2);
    let results = AsyncCompletionQueue::new();
    let entry = results.enqueue();

    let producer = results.clone();
    scheduler.submit(move || {
        thread::sleep(Duration::from_millis(5));
        producer.dequeue_one(42u32).finish();
    });

    assert_eq!(smol::block_on(entry), Ok(42));
}

/// Manual-reset event built the way higher layers use the queue
struct ManualResetEvent {
    sync: Arc<ReentrantMutex<Cell<bool>>>,
    waiters: AsyncCompletionQueue<()>,
}

impl ManualResetEvent {
    fn new() -> Self {
        Self {
            sync: Arc::new(ReentrantMutex::new(Cell::new(false))),
            waiters: AsyncCompletionQueue::new(),
        }
    }

    /// `None` when already set
    fn wait_handle(&self, token: &CancellationToken) -> Option<PendingCompletion<()>> {
        let set = self.sync.lock();
        if set.get() {
            return None;
        }
        Some(self.waiters.enqueue_with_token(&self.sync, token))
    }

    fn set(&self) {
        let resolution = {
            let set = self.sync.lock();
            set.set(true);
            self.waiters.dequeue_all(())
        };
        resolution.finish();
    }
}

#[test]
fn test_manual_reset_event_releases_all_waiters() {
    let scheduler = scheduler(4);
    let event = Arc::new(ManualResetEvent::new());
    let released = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let handle = event.wait_handle(&CancellationToken::none()).unwrap();
        let released = Arc::clone(&released);
        scheduler.submit(move || {
            if handle.wait().is_ok() {
                released.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    assert_eq!(event.waiters.len(), 3);

    event.set();
    wait_for_completed(&scheduler, 3);
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert!(event.waiters.is_empty());
    assert!(event.wait_handle(&CancellationToken::none()).is_none());
}

#[test]
fn test_canceled_waiter_leaves_event_unaffected() {
    let event = ManualResetEvent::new();
    let token = CancellationToken::new();

    let canceled = event.wait_handle(&token).unwrap();
    let other = event.wait_handle(&CancellationToken::none()).unwrap();
    assert_eq!(event.waiters.len(), 2);

    token.cancel();
    assert!(canceled.is_canceled());
    assert_eq!(event.waiters.len(), 1);

    event.set();
    assert!(other.is_completed());
    assert!(canceled.is_canceled());
}

#[test]
fn test_waiter_canceled_under_event_lock() {
    let event = ManualResetEvent::new();
    let token = CancellationToken::new();
    let handle = event.wait_handle(&token).unwrap();

    let (done, canceled) = crossbeam_channel::bounded(1);
    let canceler = thread::spawn({
        let sync = Arc::clone(&event.sync);
        move || {
            let _held = sync.lock();
            token.cancel();
            let _ = done.send(());
        }
    });

    assert!(canceled.recv_timeout(Duration::from_secs(5)).is_ok());
    canceler.join().unwrap();
    assert!(handle.is_canceled());
    assert!(event.waiters.is_empty());
}

#[test]
fn test_pre_canceled_token_never_queues() {
    let event = ManualResetEvent::new();
    let token = CancellationToken::new();
    token.cancel();

    let handle = event.wait_handle(&token).unwrap();
    assert!(handle.is_canceled());
    assert!(event.waiters.is_empty());
}
