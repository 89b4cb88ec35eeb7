//! Worker Supervisor
//!
//! Owns the worker join handles, replaces workers that die from a panicking
//! job and wakes workers until all have exited on shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::worker::{spawn_worker, Shared, WorkerEvent};
use crate::error::SchedulerError;

/// How often a stopping supervisor re-wakes workers that have not exited yet
const SHUTDOWN_NUDGE: Duration = Duration::from_millis(10);

/// First delay before retrying a worker the OS refused to start
const RESPAWN_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound for the doubling retry delay
const RESPAWN_BACKOFF_MAX: Duration = Duration::from_secs(2);

struct Supervisor {
    shared: Arc<Shared>,
    workers: Vec<Option<JoinHandle<()>>>,
    /// Sender handed to replacement workers
    events: Sender<WorkerEvent>,
    inbox: Receiver<WorkerEvent>,
    /// Worker threads currently running
    live: usize,
    /// Indices whose replacement could not be started yet
    vacant: Vec<usize>,
    retry_delay: Duration,
    stopping: bool,
}

/// Start the supervisor thread, named `{thread_name}-supervisor`
pub(crate) fn spawn(
    shared: Arc<Shared>,
    events: Sender<WorkerEvent>,
    inbox: Receiver<WorkerEvent>,
) -> Result<JoinHandle<()>, SchedulerError> {
    let name = format!("{}-supervisor", shared.thread_name);
    let supervisor = Supervisor {
        shared,
        workers: Vec::new(),
        events,
        inbox,
        live: 0,
        vacant: Vec::new(),
        retry_delay: RESPAWN_BACKOFF,
        stopping: false,
    };

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || supervisor.run())
        .map_err(|source| SchedulerError::Spawn { name, source })
}

impl Supervisor {
    fn run(mut self) {
        loop {
            self.shared.live_workers.store(self.live, Ordering::SeqCst);
            if self.stopping && self.live == 0 {
                break;
            }

            let timeout = if self.stopping {
                Some(SHUTDOWN_NUDGE)
            } else if !self.vacant.is_empty() {
                Some(self.retry_delay)
            } else {
                None
            };

            let event = match timeout {
                Some(timeout) => match self.inbox.recv_timeout(timeout) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        self.on_timeout();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.inbox.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                WorkerEvent::Started { index, handle } => self.on_started(index, handle),
                WorkerEvent::Exited { index, panicked } => self.on_exited(index, panicked),
                WorkerEvent::Shutdown => {
                    self.stopping = true;
                    self.vacant.clear();
                    self.shared.signal.release(self.live);
                }
            }
        }

        tracing::debug!(name = %self.shared.thread_name, "supervisor stopped");
    }

    fn on_started(&mut self, index: usize, handle: JoinHandle<()>) {
        self.store(index, handle);
        self.live += 1;
    }

    fn store(&mut self, index: usize, handle: JoinHandle<()>) {
        if index >= self.workers.len() {
            self.workers.resize_with(index + 1, || None);
        }
        self.workers[index] = Some(handle);
    }

    fn on_timeout(&mut self) {
        if self.stopping {
            self.shared.signal.release(self.live);
            return;
        }

        for index in std::mem::take(&mut self.vacant) {
            if !self.respawn(index) {
                self.vacant.push(index);
            }
        }
        if !self.vacant.is_empty() {
            self.retry_delay = (self.retry_delay * 2).min(RESPAWN_BACKOFF_MAX);
        }
    }

    fn on_exited(&mut self, index: usize, panicked: bool) {
        if let Some(handle) = self.workers.get_mut(index).and_then(Option::take) {
            // The panic payload was already reported by the panic hook
            let _ = handle.join();
        }
        self.live = self.live.saturating_sub(1);

        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!(worker = index, panicked, "worker thread died, spawning a replacement");
        if !self.respawn(index) && !self.vacant.contains(&index) {
            self.vacant.push(index);
        }
    }

    /// Start a replacement for `index`, `false` if the OS refused
    fn respawn(&mut self, index: usize) -> bool {
        match spawn_worker(&self.shared, index, &self.events) {
            Ok(handle) => {
                self.store(index, handle);
                self.live += 1;
                self.shared.respawned.fetch_add(1, Ordering::SeqCst);
                if self.vacant.is_empty() {
                    self.retry_delay = RESPAWN_BACKOFF;
                }
                true
            }
            Err(err) => {
                self.shared.failed_respawns.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    worker = index,
                    error = %err,
                    retry_in = ?self.retry_delay,
                    "could not replace worker thread"
                );
                false
            }
        }
    }
}
