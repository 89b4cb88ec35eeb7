//! Threading Model
//!
//! Fixed-size worker pool draining a shared lock-free queue.
//! - Workers drain cooperatively, then park on a spin-then-block signal
//! - Any thread may help drain through `try_cooperate`
//! - A supervisor thread replaces workers killed by panicking jobs

mod pool;
mod supervisor;
mod worker;

pub use pool::*;
