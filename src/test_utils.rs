//! Shared helpers for unit tests.

use std::sync::{Mutex, MutexGuard, Once, PoisonError};

static INIT_LOGGING: Once = Once::new();
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that start a runtime: one runtime per process at a
/// time is part of the contract, and the test harness runs in parallel.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    RUNTIME_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}
