//! Wake Signal
//!
//! Counting semaphore tuned for sub-millisecond jobs: a waiter polls for a
//! permit for a bounded number of iterations before parking on a condvar.

use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Spin-then-block counting semaphore.
///
/// `release(n)` may grant more permits than there are waiters; the surplus
/// stays available and later waiters return immediately.
pub struct WakeSignal {
    /// Available permits
    permits: CachePadded<AtomicUsize>,
    /// Threads parked (or about to park) on the condvar
    sleepers: CachePadded<AtomicUsize>,
    /// Park lock, only taken on the blocking paths
    lock: Mutex<()>,
    condvar: Condvar,
    spin_count: u32,
}

impl std::fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSignal")
            .field("permits", &self.available_permits())
            .field("sleepers", &self.sleepers())
            .field("spin_count", &self.spin_count)
            .finish()
    }
}

impl WakeSignal {
    /// Create a signal with no permits
    pub fn new(spin_count: u32) -> Self {
        Self {
            permits: CachePadded::new(AtomicUsize::new(0)),
            sleepers: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            spin_count,
        }
    }

    /// Grant `n` permits and wake up to `n` parked waiters
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }

        self.permits.fetch_add(n, Ordering::SeqCst);

        // A waiter bumps `sleepers` under the lock before its last permit
        // check, so either it sees our permits or we see it here.
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = self.lock.lock();
        let to_wake = n.min(self.sleepers.load(Ordering::SeqCst));
        for _ in 0..to_wake {
            self.condvar.notify_one();
        }
    }

    /// Take a permit if one is available, never blocks
    pub fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::SeqCst);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Consume one permit, spinning first and blocking second
    pub fn wait(&self) {
        for _ in 0..self.spin_count {
            if self.try_acquire() {
                return;
            }
            hint::spin_loop();
        }

        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        while !self.try_acquire() {
            self.condvar.wait(&mut guard);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Permits granted but not yet consumed
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }

    /// Approximate number of parked waiters
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }

    pub fn spin_count(&self) -> u32 {
        self.spin_count
    }
}
