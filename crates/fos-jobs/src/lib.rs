//! fOS Jobs
//!
//! Low-latency job scheduler for farming out sub-millisecond work across
//! CPU cores.
//!
//! # Components
//! - `pooled`: reference-counted reusable closures
//! - `wake`: spin-then-block counting semaphore
//! - `queue`: lock-free MPMC work queue
//! - `thread`: worker pool, cooperative draining and worker supervision
//! - `completion`: cancelable completion queue for async locks and events
//!
//! # Example
//! ```rust,ignore
//! use fos_jobs::Scheduler;
//!
//! let scheduler = Scheduler::with_worker_threads(4)?;
//! scheduler.submit(|| println!("hello from a worker"));
//! while scheduler.try_cooperate() {}
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod pooled;
pub mod queue;
pub mod thread;
pub mod wake;

pub use completion::{
    AsyncCompletionQueue, CancellationToken, CompletionState, PendingCompletion, Registration,
    Resolution,
};
pub use config::{SchedulerConfig, default_worker_threads, DEFAULT_SPIN_COUNT};
pub use error::{Canceled, SchedulerError};
pub use pooled::{ClosurePool, LifetimeTracked, PoolStats, PooledClosure};
pub use queue::{WorkItem, WorkQueue};
pub use thread::Scheduler;
pub use wake::WakeSignal;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
