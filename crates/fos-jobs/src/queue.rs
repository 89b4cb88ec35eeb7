//! Work Queue
//!
//! Unbounded lock-free MPMC queue of work items shared by the submitting
//! threads and the workers.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::pooled::LifetimeTracked;

// ============================================================================
// Work Items
// ============================================================================

/// A unit of work sitting in the queue
pub struct WorkItem {
    kind: WorkKind,
}

enum WorkKind {
    /// Boxed closure, runs exactly once
    Once(Box<dyn FnOnce() + Send + 'static>),
    /// Shared closure queued several times
    Shared(Arc<dyn Fn() + Send + Sync + 'static>),
    /// Reference-counted work; one reference is held per queued copy
    Tracked(ReleaseOnDrop),
}

/// Releases the held reference when dropped, executed or not
struct ReleaseOnDrop(Option<Arc<dyn LifetimeTracked>>);

impl ReleaseOnDrop {
    fn invoke(&self) {
        if let Some(tracker) = &self.0 {
            tracker.invoke();
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(tracker) = self.0.take() {
            tracker.release();
        }
    }
}

impl WorkItem {
    /// Wrap a one-shot closure
    pub fn once<F>(job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: WorkKind::Once(Box::new(job)),
        }
    }

    /// Wrap one copy of a shared closure
    pub fn shared(job: Arc<dyn Fn() + Send + Sync + 'static>) -> Self {
        Self {
            kind: WorkKind::Shared(job),
        }
    }

    /// Wrap tracked work. The caller must already have taken the reference
    /// this item gives back after running.
    pub fn tracked(tracker: Arc<dyn LifetimeTracked>) -> Self {
        Self {
            kind: WorkKind::Tracked(ReleaseOnDrop(Some(tracker))),
        }
    }

    /// Whether running this item gives back a lifetime reference
    pub fn is_tracked(&self) -> bool {
        matches!(self.kind, WorkKind::Tracked(_))
    }

    /// Run the item on the current thread
    pub fn execute(self) {
        match self.kind {
            WorkKind::Once(job) => job(),
            WorkKind::Shared(job) => job(),
            WorkKind::Tracked(guard) => guard.invoke(),
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            WorkKind::Once(_) => "once",
            WorkKind::Shared(_) => "shared",
            WorkKind::Tracked(_) => "tracked",
        };
        f.debug_struct("WorkItem").field("kind", &kind).finish()
    }
}

// ============================================================================
// Work Queue
// ============================================================================

/// Unbounded MPMC queue of pending work, FIFO for a single producer
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: SegQueue<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: SegQueue::new(),
        }
    }

    /// Append an item, never blocks
    pub fn push(&self, item: WorkItem) {
        self.items.push(item);
    }

    /// Take the oldest visible item
    pub fn pop(&self) -> Option<WorkItem> {
        self.items.pop()
    }

    /// Approximate number of queued items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
