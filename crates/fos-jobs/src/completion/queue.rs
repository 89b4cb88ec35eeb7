//! Async Completion Queue
//!
//! Ordered collection of pending completions. Mutating operations remove
//! entries under the queue lock and hand back a `Resolution` that completes
//! or cancels them afterwards, so callers can resolve outside their own locks.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use super::cancel::CancellationToken;
use super::pending::PendingCompletion;

enum Outcome<T> {
    Complete(T),
    Cancel,
}

/// Entries removed from a queue, resolved when finished or dropped
pub struct Resolution<T: Clone> {
    entries: Vec<PendingCompletion<T>>,
    outcome: Option<Outcome<T>>,
}

impl<T: Clone> Resolution<T> {
    fn new(entries: Vec<PendingCompletion<T>>, outcome: Outcome<T>) -> Self {
        Self {
            entries,
            outcome: Some(outcome),
        }
    }

    /// Entries this resolution will resolve
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing was removed, resolving is a no-op
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the removed entries now
    pub fn finish(self) {}

    fn resolve(&mut self) {
        let Some(outcome) = self.outcome.take() else {
            return;
        };

        let entries = mem::take(&mut self.entries);
        match outcome {
            Outcome::Complete(value) => {
                for entry in entries {
                    entry.complete(value.clone());
                }
            }
            Outcome::Cancel => {
                for entry in entries {
                    entry.cancel();
                }
            }
        }
    }
}

impl<T: Clone> Drop for Resolution<T> {
    fn drop(&mut self) {
        self.resolve();
    }
}

impl<T: Clone> std::fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self.outcome {
            Some(Outcome::Complete(_)) => "complete",
            Some(Outcome::Cancel) => "cancel",
            None => "resolved",
        };
        f.debug_struct("Resolution")
            .field("entries", &self.entries.len())
            .field("outcome", &outcome)
            .finish()
    }
}

/// FIFO of pending completions used to build async locks and events
pub struct AsyncCompletionQueue<T> {
    entries: Arc<Mutex<VecDeque<PendingCompletion<T>>>>,
}

impl<T> Clone for AsyncCompletionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for AsyncCompletionQueue<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<T> std::fmt::Debug for AsyncCompletionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCompletionQueue")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> AsyncCompletionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Append a new pending entry
    pub fn enqueue(&self) -> PendingCompletion<T> {
        let entry = PendingCompletion::new();
        self.entries.lock().push_back(entry.clone());
        entry
    }

    /// Append a pending entry that `token` can cancel.
    ///
    /// An already-canceled token yields a canceled handle and leaves the
    /// queue untouched. On cancellation the entry is removed while `sync` is
    /// held and resolved after it is released. `sync` is reentrant, so the
    /// token may be canceled by a thread that already holds it.
    pub fn enqueue_with_token<G>(
        &self,
        sync: &Arc<ReentrantMutex<G>>,
        token: &CancellationToken,
    ) -> PendingCompletion<T>
    where
        G: Send + 'static,
    {
        if token.is_canceled() {
            return PendingCompletion::canceled();
        }

        let entry = self.enqueue();

        let queue = self.clone();
        let held_sync = Arc::clone(sync);
        let target = entry.clone();
        let registration = token.try_register(move || {
            let resolution = {
                let _held = held_sync.lock();
                queue.try_cancel(&target)
            };
            resolution.finish();
        });

        match registration {
            Some(registration) => entry.attach_registration(registration),
            // Canceled after the first check
            None if token.is_canceled() => {
                let resolution = {
                    let _held = sync.lock();
                    self.try_cancel(&entry)
                };
                resolution.finish();
            }
            None => {}
        }

        entry
    }

    /// Remove the oldest entry, completing it with `result`
    pub fn dequeue_one(&self, result: T) -> Resolution<T> {
        let entries = self.entries.lock().pop_front().into_iter().collect();
        Resolution::new(entries, Outcome::Complete(result))
    }

    /// Remove every entry queued before the lock is taken, completing each
    /// with `result`
    pub fn dequeue_all(&self, result: T) -> Resolution<T> {
        let entries = mem::take(&mut *self.entries.lock());
        Resolution::new(entries.into(), Outcome::Complete(result))
    }

    /// Remove and cancel `entry` if it is still queued
    pub fn try_cancel(&self, entry: &PendingCompletion<T>) -> Resolution<T> {
        let removed = {
            let mut entries = self.entries.lock();
            let index = entries.iter().position(|queued| queued.ptr_eq(entry));
            index.and_then(|index| entries.remove(index))
        };
        Resolution::new(removed.into_iter().collect(), Outcome::Cancel)
    }

    /// Remove and cancel every queued entry
    pub fn cancel_all(&self) -> Resolution<T> {
        let entries = mem::take(&mut *self.entries.lock());
        Resolution::new(entries.into(), Outcome::Cancel)
    }
}
