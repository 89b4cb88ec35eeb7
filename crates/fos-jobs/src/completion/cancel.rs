//! Cancellation Tokens

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

struct TokenInner {
    canceled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// Cooperative cancellation signal shared by clones
#[derive(Clone)]
pub struct CancellationToken {
    inner: Option<Arc<TokenInner>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                canceled: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
            })),
        }
    }

    /// A token that can never be canceled
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.canceled.load(Ordering::SeqCst))
    }

    /// Cancel the token and run every registered callback on this thread.
    ///
    /// Only the first call runs callbacks.
    pub fn cancel(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = std::mem::take(&mut inner.callbacks.lock().entries);
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Register `callback` to run on cancellation.
    ///
    /// Returns `None` without running it if the token is already canceled
    /// or can never be canceled.
    pub fn try_register<F>(&self, callback: F) -> Option<Registration>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_or_return(callback).ok().flatten()
    }

    /// Register `callback`, running it right away if already canceled
    pub fn register<F>(&self, callback: F) -> Option<Registration>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.register_or_return(callback) {
            Ok(registration) => registration,
            Err(callback) => {
                callback();
                None
            }
        }
    }

    /// Hands the callback back when the token is already canceled
    fn register_or_return<F>(&self, callback: F) -> Result<Option<Registration>, F>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };

        let mut callbacks = inner.callbacks.lock();
        // Checked under the lock; `cancel` flips the flag before taking it
        if inner.canceled.load(Ordering::SeqCst) {
            return Err(callback);
        }

        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, Box::new(callback)));

        Ok(Some(Registration {
            token: Arc::downgrade(inner),
            id,
        }))
    }
}

/// Keeps a callback registered; dropping it unregisters the callback
pub struct Registration {
    token: Weak<TokenInner>,
    id: u64,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.callbacks.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
