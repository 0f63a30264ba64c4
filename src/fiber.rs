//! Thread-backed task continuations.
//!
//! Each task runs on its own OS thread (a *fiber*) synchronized with its
//! domain's scheduler thread through a two-party [`Baton`]. At any instant
//! exactly one of {scheduler thread, one fiber} runs per domain, which is
//! what makes execution inside a domain cooperatively single-threaded: the
//! fiber hands the baton back only at suspension points, and the scheduler
//! blocks while the fiber holds it.
//!
//! A suspended fiber carries no scheduler state: it is parked inside
//! [`Baton::yield_to_scheduler`] and everything it needs to continue lives
//! on its own stack.

use crate::ops::{run_task_body, Cx};
use crate::registry::TaskClosure;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// Whose turn it is to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Turn {
    /// The scheduler runs; the fiber is parked (suspended).
    Scheduler,
    /// The fiber runs; the scheduler is parked.
    Task,
    /// The fiber finished; its thread is exiting.
    Done,
}

#[derive(Debug)]
struct BatonInner {
    turn: Mutex<Turn>,
    cv: Condvar,
}

/// Two-party handoff between a domain's scheduler thread and one fiber.
#[derive(Debug, Clone)]
pub(crate) struct Baton {
    inner: Arc<BatonInner>,
}

impl Baton {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(BatonInner {
                turn: Mutex::new(Turn::Scheduler),
                cv: Condvar::new(),
            }),
        }
    }

    /// Scheduler side: hands the baton to the fiber and blocks until it is
    /// handed back. Returns `Turn::Scheduler` if the fiber suspended or
    /// `Turn::Done` if it finished.
    pub(crate) fn resume_task(&self) -> Turn {
        let mut turn = self.inner.turn.lock();
        *turn = Turn::Task;
        self.inner.cv.notify_all();
        while *turn == Turn::Task {
            self.inner.cv.wait(&mut turn);
        }
        *turn
    }

    /// Fiber side: blocks until the scheduler hands the baton over.
    pub(crate) fn await_turn(&self) {
        let mut turn = self.inner.turn.lock();
        while *turn != Turn::Task {
            self.inner.cv.wait(&mut turn);
        }
    }

    /// Fiber side: suspension point. Hands the baton to the scheduler and
    /// blocks until resumed.
    pub(crate) fn yield_to_scheduler(&self) {
        let mut turn = self.inner.turn.lock();
        *turn = Turn::Scheduler;
        self.inner.cv.notify_all();
        while *turn != Turn::Task {
            self.inner.cv.wait(&mut turn);
        }
    }

    /// Fiber side: final handoff; the fiber thread exits after this.
    pub(crate) fn finish(&self) {
        let mut turn = self.inner.turn.lock();
        *turn = Turn::Done;
        self.inner.cv.notify_all();
    }
}

/// A spawned task continuation.
pub(crate) struct Fiber {
    baton: Baton,
    thread: Option<thread::JoinHandle<()>>,
}

impl Fiber {
    /// Spawns the fiber thread for a task. The thread parks immediately;
    /// the first [`Fiber::resume`] starts the closure. `baton` must be the
    /// same baton captured in `cx`, so the task's suspension points hand
    /// control back to this handle.
    pub(crate) fn spawn(name: String, baton: Baton, cx: Cx, closure: TaskClosure) -> Self {
        let fiber_baton = baton.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                fiber_baton.await_turn();
                run_task_body(&cx, closure);
                fiber_baton.finish();
            })
            .unwrap_or_else(|e| panic!("failed to spawn fiber thread {name}: {e}"));
        trace!(fiber = %name, "fiber spawned");
        Self {
            baton,
            thread: Some(handle),
        }
    }

    /// Runs the fiber until its next suspension point or until it returns.
    pub(crate) fn resume(&self) -> Turn {
        self.baton.resume_task()
    }

    /// Joins the finished fiber thread.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl core::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fiber").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baton_round_trips_between_parties() {
        let baton = Baton::new();
        let task_side = baton.clone();
        let handle = thread::spawn(move || {
            task_side.await_turn();
            // First leg: suspend once.
            task_side.yield_to_scheduler();
            // Second leg: finish.
            task_side.finish();
        });

        assert_eq!(baton.resume_task(), Turn::Scheduler);
        assert_eq!(baton.resume_task(), Turn::Done);
        handle.join().expect("fiber thread join");
    }

    #[test]
    fn finish_without_suspension() {
        let baton = Baton::new();
        let task_side = baton.clone();
        let handle = thread::spawn(move || {
            task_side.await_turn();
            task_side.finish();
        });

        assert_eq!(baton.resume_task(), Turn::Done);
        handle.join().expect("fiber thread join");
    }
}
