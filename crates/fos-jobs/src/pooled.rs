//! Pooled Closures
//!
//! Reference-counted reusable jobs. A `ClosurePool` owns the job body and
//! hands out `PooledClosure` handles that carry per-submission state; once
//! the last reference to a handle is released its slot goes back to the pool
//! instead of being freed, so hot submission paths stop allocating.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Idle slots a pool keeps by default
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Reference-counting hooks for work the scheduler may run several times.
///
/// The scheduler takes one reference per queued copy and releases it after
/// the copy has run, panicking or not.
pub trait LifetimeTracked: Send + Sync + 'static {
    /// Run the work once
    fn invoke(&self);

    /// Take an extra reference
    fn add_reference(&self);

    /// Drop one reference; the last one recycles the work.
    ///
    /// # Panics
    /// When called more times than references were taken.
    fn release(self: Arc<Self>);

    /// Current number of references
    fn reference_count(&self) -> usize;
}

type Body<S> = Arc<dyn Fn(&S) + Send + Sync + 'static>;

/// A reusable slot: the body plus the state of the current lease
struct Slot<S> {
    refs: AtomicUsize,
    state: Option<S>,
    body: Body<S>,
    pool: Weak<PoolShared<S>>,
}

impl<S: Send + Sync + 'static> LifetimeTracked for Slot<S> {
    fn invoke(&self) {
        if let Some(state) = &self.state {
            (self.body)(state);
        }
    }

    fn add_reference(&self) {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "add_reference on a recycled closure");
    }

    fn release(self: Arc<Self>) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "pooled closure released more times than referenced");

        if previous == 1 {
            if let Some(pool) = self.pool.upgrade() {
                pool.recycle(self);
            }
        }
    }

    fn reference_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

struct PoolShared<S> {
    body: Body<S>,
    free: Mutex<Vec<Arc<Slot<S>>>>,
    max_idle: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl<S> PoolShared<S> {
    fn recycle(&self, mut slot: Arc<Slot<S>>) {
        // Zero references means no handle or queued item can still see the slot
        let Some(exclusive) = Arc::get_mut(&mut slot) else {
            return;
        };
        exclusive.state = None;

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(slot);
        }
    }
}

/// Pool usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots waiting for reuse
    pub idle: usize,
    /// Slots ever allocated
    pub allocated: u64,
    /// Leases served from a recycled slot
    pub reused: u64,
}

/// Pool of reusable closures sharing one body
pub struct ClosurePool<S> {
    shared: Arc<PoolShared<S>>,
}

impl<S> Clone for ClosurePool<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> std::fmt::Debug for ClosurePool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosurePool")
            .field("idle", &self.shared.free.lock().len())
            .field("max_idle", &self.shared.max_idle)
            .field("allocated", &self.shared.allocated.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: Send + Sync + 'static> ClosurePool<S> {
    /// Create a pool running `body` against each lease's state
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        Self::with_capacity(DEFAULT_MAX_IDLE, body)
    }

    /// Create a pool that keeps at most `max_idle` recycled slots
    pub fn with_capacity<F>(max_idle: usize, body: F) -> Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(PoolShared {
                body: Arc::new(body),
                free: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a closure carrying `state`, holding one reference
    pub fn get(&self, state: S) -> PooledClosure<S> {
        let recycled = self.shared.free.lock().pop();

        let slot = match recycled {
            Some(mut slot) => match Arc::get_mut(&mut slot) {
                Some(exclusive) => {
                    exclusive.state = Some(state);
                    *exclusive.refs.get_mut() = 1;
                    self.shared.reused.fetch_add(1, Ordering::Relaxed);
                    slot
                }
                None => self.allocate(state),
            },
            None => self.allocate(state),
        };

        PooledClosure {
            slot: ManuallyDrop::new(slot),
        }
    }

    fn allocate(&self, state: S) -> Arc<Slot<S>> {
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        Arc::new(Slot {
            refs: AtomicUsize::new(1),
            state: Some(state),
            body: Arc::clone(&self.shared.body),
            pool: Arc::downgrade(&self.shared),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.shared.free.lock().len(),
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a leased closure.
///
/// Cloning takes a reference and dropping releases it, so "retain before
/// submit, release after own use" is the only way to hold one.
pub struct PooledClosure<S: Send + Sync + 'static> {
    slot: ManuallyDrop<Arc<Slot<S>>>,
}

impl<S: Send + Sync + 'static> PooledClosure<S> {
    /// Run the body inline on the calling thread
    pub fn invoke(&self) {
        self.slot.invoke();
    }

    /// References held by handles and queued submissions
    pub fn reference_count(&self) -> usize {
        self.slot.reference_count()
    }

    /// Type-erased view of the slot for the work queue
    pub(crate) fn tracker(&self) -> Arc<dyn LifetimeTracked> {
        let slot: Arc<Slot<S>> = Arc::clone(&*self.slot);
        slot
    }
}

impl<S: Send + Sync + 'static> Clone for PooledClosure<S> {
    fn clone(&self) -> Self {
        self.slot.add_reference();
        Self {
            slot: ManuallyDrop::new(Arc::clone(&*self.slot)),
        }
    }
}

impl<S: Send + Sync + 'static> Drop for PooledClosure<S> {
    fn drop(&mut self) {
        // SAFETY: `slot` is never touched again after this point
        let slot = unsafe { ManuallyDrop::take(&mut self.slot) };
        slot.release();
    }
}

impl<S: Send + Sync + 'static> std::fmt::Debug for PooledClosure<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClosure")
            .field("references", &self.reference_count())
            .finish()
    }
}
