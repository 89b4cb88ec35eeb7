//! Pending Completions
//!
//! One-shot result slot that moves out of `Pending` exactly once. Waiters
//! can block on it or await it.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::cancel::Registration;
use crate::error::Canceled;

/// Where a pending completion is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Completed,
    Canceled,
}

struct Inner<T> {
    state: CompletionState,
    result: Option<T>,
    wakers: Vec<Waker>,
    /// Token callback to drop once resolved
    registration: Option<Registration>,
}

impl<T: Clone> Inner<T> {
    fn outcome(&self) -> Option<Result<T, Canceled>> {
        match self.state {
            CompletionState::Pending => None,
            CompletionState::Completed => self.result.clone().map(Ok),
            CompletionState::Canceled => Some(Err(Canceled)),
        }
    }
}

struct Slot<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

/// Handle to an entry of an `AsyncCompletionQueue`.
///
/// Clones share the same slot. Resolution happens through the queue.
pub struct PendingCompletion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for PendingCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for PendingCompletion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCompletion")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> PendingCompletion<T> {
    pub(crate) fn new() -> Self {
        Self::with_state(CompletionState::Pending)
    }

    /// A handle that is canceled from the start
    pub(crate) fn canceled() -> Self {
        Self::with_state(CompletionState::Canceled)
    }

    fn with_state(state: CompletionState) -> Self {
        Self {
            slot: Arc::new(Slot {
                inner: Mutex::new(Inner {
                    state,
                    result: None,
                    wakers: Vec::new(),
                    registration: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> CompletionState {
        self.slot.inner.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == CompletionState::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.state() == CompletionState::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == CompletionState::Canceled
    }

    /// Whether both handles refer to the same entry
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Keep a token registration alive until this entry resolves
    pub(crate) fn attach_registration(&self, registration: Registration) {
        let mut inner = self.slot.inner.lock();
        if inner.state == CompletionState::Pending {
            inner.registration = Some(registration);
            return;
        }
        drop(inner);
        drop(registration);
    }

    /// Move to `Completed` with `value`, `false` if already resolved
    pub(crate) fn complete(&self, value: T) -> bool {
        self.resolve(CompletionState::Completed, Some(value))
    }

    /// Move to `Canceled`, `false` if already resolved
    pub(crate) fn cancel(&self) -> bool {
        self.resolve(CompletionState::Canceled, None)
    }

    fn resolve(&self, state: CompletionState, value: Option<T>) -> bool {
        let (wakers, registration) = {
            let mut inner = self.slot.inner.lock();
            if inner.state != CompletionState::Pending {
                return false;
            }
            inner.state = state;
            inner.result = value;
            (mem::take(&mut inner.wakers), inner.registration.take())
        };

        self.slot.ready.notify_all();
        drop(registration);
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> PendingCompletion<T> {
    /// Result if completed
    pub fn result(&self) -> Option<T> {
        self.slot.inner.lock().result.clone()
    }

    /// Block until resolved
    pub fn wait(&self) -> Result<T, Canceled> {
        let mut inner = self.slot.inner.lock();
        loop {
            if let Some(outcome) = inner.outcome() {
                return outcome;
            }
            self.slot.ready.wait(&mut inner);
        }
    }

    /// Block until resolved or `timeout` elapses, `None` on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Canceled>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.slot.inner.lock();
        loop {
            if let Some(outcome) = inner.outcome() {
                return Some(outcome);
            }
            if self.slot.ready.wait_until(&mut inner, deadline).timed_out() {
                return inner.outcome();
            }
        }
    }
}

impl<T: Clone> Future for PendingCompletion<T> {
    type Output = Result<T, Canceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.slot.inner.lock();
        if let Some(outcome) = inner.outcome() {
            return Poll::Ready(outcome);
        }

        if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
