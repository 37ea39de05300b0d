// Transition lock with an advisory timer. Passes that hold the lock
// past the deadline are logged, never aborted: a wedged pass blocks
// later passes until it returns, and the log is the only signal.

use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub struct TimeoutLock<T> {
    name: &'static str,
    warn_after: Duration,
    inner: Mutex<T>,
}

impl<T> TimeoutLock<T> {
    pub fn new(name: &'static str, warn_after: Duration, value: T) -> Self {
        Self {
            name,
            warn_after,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> TimeoutGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let (tx, rx) = mpsc::channel::<()>();
        let name = self.name;
        let warn_after = self.warn_after;
        std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(warn_after) {
                tracing::warn!(
                    lock = name,
                    held_secs = warn_after.as_secs(),
                    "netfilter: Lock held past advisory deadline"
                );
            }
        });

        TimeoutGuard {
            guard,
            _release: tx,
        }
    }
}

pub struct TimeoutGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    // Dropping the sender disconnects the timer thread before it warns.
    _release: Sender<()>,
}

impl<T> Deref for TimeoutGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TimeoutGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
