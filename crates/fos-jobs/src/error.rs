//! Scheduler Errors

use std::io;

/// Errors raised while starting a scheduler
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Configuration rejected before any thread was spawned
    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(String),

    /// The OS refused to start a thread
    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// The pending completion was canceled before it received a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Pending completion was canceled")]
pub struct Canceled;
