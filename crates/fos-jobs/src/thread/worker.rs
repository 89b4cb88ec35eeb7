//! Worker Threads
//!
//! Shared scheduler state, the cooperative execution entry point and the
//! worker loop.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use crossbeam_utils::CachePadded;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::queue::WorkQueue;
use crate::wake::WakeSignal;

thread_local! {
    /// Address of the `Shared` this thread works for, 0 off the pool
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

fn pool_id(shared: &Shared) -> usize {
    shared as *const Shared as usize
}

/// Whether the calling thread is a worker of some scheduler
pub(crate) fn is_pool_worker() -> bool {
    WORKER_OF.with(Cell::get) != 0
}

/// Whether the calling thread is one of `shared`'s own workers
pub(crate) fn is_worker_of(shared: &Shared) -> bool {
    WORKER_OF.with(Cell::get) == pool_id(shared)
}

/// Lifecycle notices consumed by the supervisor
pub(crate) enum WorkerEvent {
    /// A worker thread was started at `index`
    Started { index: usize, handle: JoinHandle<()> },
    /// A worker thread is about to exit
    Exited { index: usize, panicked: bool },
    /// The scheduler is shutting down
    Shutdown,
}

/// State shared by a scheduler handle, its workers and its supervisor
pub(crate) struct Shared {
    pub(crate) queue: WorkQueue,
    pub(crate) signal: WakeSignal,
    /// Items enqueued minus items dequeued
    pub(crate) work_scheduled: CachePadded<AtomicUsize>,
    /// Threads currently running an item
    pub(crate) threads_busy: CachePadded<AtomicUsize>,
    /// Items run to completion (or panic) since startup
    pub(crate) completed: CachePadded<AtomicU64>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) respawned: AtomicU64,
    pub(crate) failed_respawns: AtomicU64,
    /// Worker threads currently running, as seen by the supervisor
    pub(crate) live_workers: AtomicUsize,
    pub(crate) thread_name: String,
    pub(crate) stack_size: Option<usize>,
}

impl Shared {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        Self {
            queue: WorkQueue::new(),
            signal: WakeSignal::new(config.spin_count),
            work_scheduled: CachePadded::new(AtomicUsize::new(0)),
            threads_busy: CachePadded::new(AtomicUsize::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
            shutting_down: AtomicBool::new(false),
            respawned: AtomicU64::new(0),
            failed_respawns: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            thread_name: config.thread_name.clone(),
            stack_size: config.stack_size,
        }
    }

    /// Run one queued item on the calling thread, `false` if none was queued
    pub(crate) fn try_cooperate(&self) -> bool {
        let Some(item) = self.queue.pop() else {
            return false;
        };

        // Busy goes up before scheduled goes down so an in-flight item is
        // always visible in at least one of them.
        self.threads_busy.fetch_add(1, Ordering::SeqCst);
        self.work_scheduled.fetch_sub(1, Ordering::SeqCst);

        let _finished = FinishGuard(self);
        item.execute();
        true
    }
}

/// Counter updates that must happen even if the item panics
struct FinishGuard<'a>(&'a Shared);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.threads_busy.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tells the supervisor a worker is leaving, normally or by panic
struct ExitNotice {
    index: usize,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        // A missing supervisor means the scheduler is already gone
        let _ = self.events.send(WorkerEvent::Exited {
            index: self.index,
            panicked: thread::panicking(),
        });
    }
}

/// Start worker `index`, named `{thread_name}-{index}`
pub(crate) fn spawn_worker(
    shared: &Arc<Shared>,
    index: usize,
    events: &Sender<WorkerEvent>,
) -> Result<JoinHandle<()>, SchedulerError> {
    let name = format!("{}-{}", shared.thread_name, index);
    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(bytes) = shared.stack_size {
        builder = builder.stack_size(bytes);
    }

    let worker_shared = Arc::clone(shared);
    let events = events.clone();

    // The notice only exists once the thread runs; a refused spawn sends nothing
    builder
        .spawn(move || {
            let _notice = ExitNotice { index, events };
            run_worker(&worker_shared, index);
        })
        .map_err(|source| SchedulerError::Spawn { name, source })
}

fn run_worker(shared: &Shared, index: usize) {
    WORKER_OF.with(|owner| owner.set(pool_id(shared)));
    tracing::debug!(worker = index, "worker started");

    loop {
        while shared.try_cooperate() {}

        shared.signal.wait();
        if shared.shutting_down.load(Ordering::SeqCst) {
            tracing::debug!(worker = index, "worker stopping");
            return;
        }
    }
}
