//! Scheduler
//!
//! Fixed-size pool of workers draining one shared queue. Submission never
//! blocks; the only blocking point is an idle worker parking on the wake
//! signal.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::supervisor;
use super::worker::{is_pool_worker, is_worker_of, spawn_worker, Shared, WorkerEvent};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::pooled::PooledClosure;
use crate::queue::WorkItem;

static GLOBAL_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// Job scheduler backed by a fixed set of worker threads
pub struct Scheduler {
    shared: Arc<Shared>,
    worker_threads: usize,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: Sender<WorkerEvent>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_threads", &self.worker_threads)
            .field("work_scheduled", &self.work_scheduled())
            .field("threads_busy", &self.threads_busy())
            .field("completed_work", &self.completed_work())
            .field("respawned_workers", &self.respawned_workers())
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

impl Scheduler {
    /// Start a scheduler with its workers and supervisor
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let worker_threads = config.resolved_worker_threads();
        let shared = Arc::new(Shared::new(&config));
        let (events, inbox) = crossbeam_channel::unbounded();
        let supervisor = supervisor::spawn(Arc::clone(&shared), events.clone(), inbox)?;

        // From here on an early return drops `scheduler`, which shuts down
        // the workers started so far.
        let scheduler = Self {
            shared,
            worker_threads,
            supervisor: Mutex::new(Some(supervisor)),
            events,
            config,
        };

        for index in 0..worker_threads {
            let handle = spawn_worker(&scheduler.shared, index, &scheduler.events)?;
            let _ = scheduler.events.send(WorkerEvent::Started { index, handle });
        }

        tracing::info!(
            name = %scheduler.config.thread_name,
            workers = worker_threads,
            spin_count = scheduler.config.spin_count,
            "Scheduler started"
        );

        Ok(scheduler)
    }

    /// Start an independent scheduler with `count` workers
    pub fn with_worker_threads(count: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default().with_worker_threads(count))
    }

    /// Process-wide scheduler, started on first use and never shut down.
    ///
    /// # Panics
    /// If the OS refuses to start its threads.
    pub fn global() -> &'static Scheduler {
        GLOBAL_SCHEDULER.get_or_init(|| {
            Scheduler::new(SchedulerConfig::default())
                .unwrap_or_else(|err| panic!("global scheduler failed to start: {err}"))
        })
    }

    /// Whether the calling thread is a scheduler worker
    pub fn is_worker_thread() -> bool {
        is_pool_worker()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Queue a one-shot job.
    ///
    /// # Panics
    /// If the scheduler is shutting down.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(1, || WorkItem::once(job));
    }

    /// Queue `job` to run exactly `repeat_count` times.
    ///
    /// # Panics
    /// If `repeat_count` is zero or the scheduler is shutting down.
    pub fn submit_repeated<F>(&self, job: F, repeat_count: usize)
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(repeat_count >= 1, "repeat_count must be at least 1");

        let job: Arc<dyn Fn() + Send + Sync> = Arc::new(job);
        let mut copies = std::iter::repeat_with(|| WorkItem::shared(Arc::clone(&job)));
        self.enqueue_many(repeat_count, &mut copies);
    }

    /// Queue `repeat_count` runs of a pooled closure, one reference each.
    ///
    /// The caller keeps its own reference; each queued run gives its
    /// reference back after running.
    ///
    /// # Panics
    /// If `repeat_count` is zero or the scheduler is shutting down.
    pub fn submit_pooled<S>(&self, job: &PooledClosure<S>, repeat_count: usize)
    where
        S: Send + Sync + 'static,
    {
        assert!(repeat_count >= 1, "repeat_count must be at least 1");

        let tracker = job.tracker();
        let mut copies = std::iter::repeat_with(|| {
            tracker.add_reference();
            WorkItem::tracked(Arc::clone(&tracker))
        });
        self.enqueue_many(repeat_count, &mut copies);
    }

    fn enqueue(&self, count: usize, make: impl FnOnce() -> WorkItem) {
        let mut once = std::iter::once_with(make);
        self.enqueue_many(count, &mut once);
    }

    fn enqueue_many(&self, count: usize, items: &mut dyn Iterator<Item = WorkItem>) {
        assert!(
            !self.shared.shutting_down.load(Ordering::SeqCst),
            "cannot submit to a scheduler that is shutting down"
        );

        self.shared.work_scheduled.fetch_add(count, Ordering::SeqCst);
        for item in items.take(count) {
            self.shared.queue.push(item);
        }
        self.shared.signal.release(count);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one queued job on the calling thread.
    ///
    /// Returns `false` without side effects when nothing is queued. A panic
    /// from the job propagates to the caller after the counters are settled.
    pub fn try_cooperate(&self) -> bool {
        self.shared.try_cooperate()
    }

    /// Stop the workers and run whatever is still queued on this thread.
    ///
    /// Idempotent. Called from one of this scheduler's own jobs (including
    /// by dropping the last handle there) it only signals the stop: the
    /// calling worker drains the queue and exits once the job returns, and
    /// the supervisor is left to finish on its own.
    pub fn shutdown(&self) {
        if self
            .shared
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let _ = self.events.send(WorkerEvent::Shutdown);
        if is_worker_of(&self.shared) {
            // Joining here would wait on this very thread
            drop(self.supervisor.lock().take());
            tracing::info!(
                name = %self.config.thread_name,
                "Scheduler shutting down from one of its workers"
            );
            return;
        }

        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                tracing::error!(name = %self.config.thread_name, "supervisor thread panicked");
            }
        }

        let mut drained = 0usize;
        while self.shared.try_cooperate() {
            drained += 1;
        }

        tracing::info!(
            name = %self.config.thread_name,
            drained,
            completed = self.completed_work(),
            "Scheduler shut down"
        );
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Jobs queued but not yet picked up
    pub fn work_scheduled(&self) -> usize {
        self.shared.work_scheduled.load(Ordering::SeqCst)
    }

    /// Jobs run since startup, panicking ones included
    pub fn completed_work(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Threads currently running a job
    pub fn threads_busy(&self) -> usize {
        self.shared.threads_busy.load(Ordering::SeqCst)
    }

    pub fn worker_threads_count(&self) -> usize {
        self.worker_threads
    }

    /// Workers replaced after a job panicked on them
    pub fn respawned_workers(&self) -> u64 {
        self.shared.respawned.load(Ordering::SeqCst)
    }

    /// Worker threads running right now. Drops below
    /// [`worker_threads_count`](Self::worker_threads_count) while a dead
    /// worker waits for the OS to accept its replacement.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    /// No job queued and none running
    pub fn is_idle(&self) -> bool {
        self.work_scheduled() == 0 && self.threads_busy() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
