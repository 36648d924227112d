//! Single-flight ownership of the model context
//!
//! The context is a single mutable resource. Generation requests try to
//! acquire it without waiting and are rejected while it is held; adapter
//! swaps and shutdown wait for it. Holding a [`RunPermit`] is the only way
//! to reach the context.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Exclusive, non-reentrant owner of a shared value
pub struct SingleFlight<T> {
    inner: Arc<Mutex<T>>,
    held: Arc<AtomicBool>,
}

impl<T> SingleFlight<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the value if nobody holds it; never waits
    pub fn try_acquire(&self) -> Option<RunPermit<T>> {
        match Arc::clone(&self.inner).try_lock_owned() {
            Ok(guard) => {
                trace!("single-flight permit acquired");
                Some(self.permit(guard))
            }
            Err(_) => None,
        }
    }

    /// Whether a permit is outstanding. Never touches the lock.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn permit(&self, guard: OwnedMutexGuard<T>) -> RunPermit<T> {
        self.held.store(true, Ordering::Release);
        RunPermit {
            guard,
            held: Arc::clone(&self.held),
        }
    }

    /// Wait until the value is free and take it.
    ///
    /// Blocks the calling thread. Must not be called while the caller
    /// already holds a permit, nor from inside an async runtime.
    pub fn acquire_blocking(&self) -> RunPermit<T> {
        let guard = Arc::clone(&self.inner).blocking_lock_owned();
        trace!("single-flight permit acquired (blocking)");
        self.permit(guard)
    }

    /// Consume the guard and return the value once no permit is outstanding
    pub fn into_inner(self) -> T {
        drop(self.acquire_blocking());

        // A released permit may still be dropping its reference.
        let mut inner = self.inner;
        loop {
            match Arc::try_unwrap(inner) {
                Ok(mutex) => return mutex.into_inner(),
                Err(shared) => {
                    inner = shared;
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Proof of exclusive access, released on drop.
///
/// Not `Clone`; it may be moved to another thread so a run can own the value
/// for its whole lifetime.
pub struct RunPermit<T> {
    guard: OwnedMutexGuard<T>,
    held: Arc<AtomicBool>,
}

impl<T> Deref for RunPermit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RunPermit<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RunPermit<T> {
    fn drop(&mut self) {
        // The guard field unlocks right after this.
        self.held.store(false, Ordering::Release);
        trace!("single-flight permit released");
    }
}
