//! Scheduler Configuration

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Spin iterations a parked worker burns before blocking
pub const DEFAULT_SPIN_COUNT: u32 = 140;

/// Prefix for worker and supervisor thread names
pub const DEFAULT_THREAD_NAME: &str = "fos-jobs";

/// Number of cores the host reports, at least 1
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Worker count for a host with `cores` cores.
///
/// One core is left to the submitting thread; single-core hosts still get one worker.
pub fn default_worker_threads(cores: usize) -> usize {
    cores.saturating_sub(1).max(1)
}

/// Scheduler configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads to spawn, `None` derives it from the core count
    pub worker_threads: Option<usize>,

    /// Spin iterations before an idle worker parks
    pub spin_count: u32,

    /// Thread name prefix
    pub thread_name: String,

    /// Worker stack size in bytes, platform default when `None`
    pub stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            spin_count: DEFAULT_SPIN_COUNT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Worker count this config will spawn
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| default_worker_threads(available_cores()))
    }

    /// Reject configs that cannot start a pool
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.worker_threads == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }
        if self.stack_size == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "stack_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
