//! Cooperative synchronization helpers.
//!
//! These primitives never block a domain thread: waiting is expressed as
//! try-acquire plus a yielding retry loop, so a waiting task remains at a
//! suspension point where other tasks run and cancellation is observed.

use crate::error::Result;
use crate::ops::Cx;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore shared between tasks on any domains.
///
/// `new(1)` gives a binary semaphore. Waiting tasks yield between
/// attempts, so acquisition is a cancellation point.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicUsize,
}

impl Semaphore {
    /// Creates a semaphore with `permits` available permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
        }
    }

    /// Takes a permit if one is available. Never suspends.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Takes a permit, yielding to other tasks until one is available.
    ///
    /// Returns `Err(Cancelled)` if the current task is cancelled while
    /// waiting.
    pub fn acquire(&self, cx: &Cx) -> Result<()> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            cx.yield_now()?;
        }
    }

    /// Returns a permit.
    pub fn release(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of currently available permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_counts_down_to_zero() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);

        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn binary_semaphore_round_trip() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }
}
