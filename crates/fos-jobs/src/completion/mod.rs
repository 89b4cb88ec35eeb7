//! Completion Queues
//!
//! Cancelable multi-waiter completions for building async locks and events
//! on top of the scheduler.

mod cancel;
mod pending;
mod queue;

pub use cancel::*;
pub use pending::*;
pub use queue::*;
