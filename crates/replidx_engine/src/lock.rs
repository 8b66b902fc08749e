//! Exclusivity lock serializing passes against one target.

use parking_lot::{Condvar, Mutex};

/// A non-reentrant mutual-exclusion lock whose ownership is a value.
///
/// Unlike a mutex guard, the [`LockToken`] returned by
/// [`acquire`](Self::acquire) is not tied to the thread that acquired it,
/// so a pass may be started on one worker thread and committed on another.
///
/// There is no timeout or cancellation: `acquire` blocks until the current
/// holder releases the lock.
#[derive(Debug, Default)]
pub struct ExclusivityLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ExclusivityLock {
    /// Creates a new, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, blocking until it is free.
    ///
    /// The lock is released when the returned token is dropped. Acquiring
    /// again while holding a token deadlocks.
    pub fn acquire(&self) -> LockToken<'_> {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        LockToken { lock: self }
    }

    /// Returns true if a token is currently outstanding.
    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.released.notify_one();
    }
}

/// Proof of ownership of an [`ExclusivityLock`].
#[derive(Debug)]
#[must_use = "the lock is released as soon as the token is dropped"]
pub struct LockToken<'a> {
    lock: &'a ExclusivityLock,
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
