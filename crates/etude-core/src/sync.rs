// src/sync.rs
//! Thin adapters over `std::sync` giving the work queue the two capabilities
//! it needs: a mutual-exclusion lock and a counting semaphore.
//!
//! Lock poisoning is ignored: a worker that panics while running a task never
//! holds the queue lock, so the protected data is always consistent.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Mutual-exclusion lock around a value.
#[derive(Debug, Default)]
pub struct Locker<T> {
    inner: Mutex<T>,
}

impl<T> Locker<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counting semaphore. `post` releases exactly one waiter.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then consumes it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Consumes a permit if one is available without blocking.
    #[cfg(test)]
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Adds one permit and wakes a single waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
