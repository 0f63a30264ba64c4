//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use tandem::time::TimerEvents;
use tandem::Builder;

static INIT_LOGGING: Once = Once::new();
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// Initialize tracing output for tests. Safe to call repeatedly.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that start a runtime: the process allows one active
/// runtime at a time and the test harness runs tests in parallel.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    RUNTIME_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A builder with `workers` worker domains, a fixed seed, and a timer
/// events source on every domain.
pub fn timer_builder(workers: usize, seed: u64) -> Builder {
    Builder::new()
        .domains(workers)
        .seed(seed)
        .events(|_| Arc::new(TimerEvents::new()))
}
