//! The events-source contract consumed by external I/O and timer code.
//!
//! The scheduler itself knows nothing about file descriptors, timers or any
//! other external completion source. Instead, each domain carries one
//! [`Events`] instance supplied at runtime construction. The contract is
//! deliberately narrow:
//!
//! - [`Events::select`] is called only when the owning domain is otherwise
//!   idle but still owns pending promises. It may block, and must return
//!   when [`Events::interrupt`] is called. Returned [`RunnableEntry`]
//!   values are pushed onto the owner domain's run queue.
//! - [`Events::interrupt`] is safe to call from any thread and must be
//!   idempotent between two consecutive `select` invocations. The events
//!   source consumes its own wakeup token inside `select`.
//!
//! An entry is built with [`Cx::task`](crate::ops::Cx::task) by binding a
//! closure to a syscall promise created with
//! [`Cx::make`](crate::ops::Cx::make). When the scheduler runs the entry it
//! executes the closure, then the promise's `on_resolve` finalizer, and
//! resolves the promise with the finalizer's value. Entries whose promise
//! has already left `Pending` (cancellation) are discarded unexecuted.

use crate::types::{DomainId, PromiseId};
use core::fmt;
use std::any::Any;

/// A runnable binding of a closure to a syscall promise.
///
/// Produced by [`Cx::task`](crate::ops::Cx::task); returned from
/// [`Events::select`] to tell the scheduler a suspended promise may resume.
pub struct RunnableEntry {
    pub(crate) promise: PromiseId,
    pub(crate) home: DomainId,
    pub(crate) work: Box<dyn FnOnce() + Send>,
}

impl RunnableEntry {
    /// Returns the id of the syscall promise this entry resolves.
    #[must_use]
    pub fn promise(&self) -> PromiseId {
        self.promise
    }
}

impl fmt::Debug for RunnableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableEntry")
            .field("promise", &self.promise)
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

/// External events source, one instance per domain.
///
/// Supplied through [`Builder::events`](crate::runtime::Builder::events);
/// see the module documentation for the full contract.
pub trait Events: Send + Sync + 'static {
    /// Waits for external events and returns the entries that became
    /// runnable. Called only by the owning domain; may block; must return
    /// once [`Events::interrupt`] is called.
    fn select(&self) -> Vec<RunnableEntry>;

    /// Forces a blocked [`Events::select`] to return early. Callable from
    /// any thread.
    fn interrupt(&self);

    /// Downcast hook so consumers (such as the timer) can recover their
    /// concrete events source from a task context.
    fn as_any(&self) -> &dyn Any;
}

/// The default events source: no external events exist.
///
/// `select` returns no entries immediately and `interrupt` does nothing;
/// the runtime exits cleanly once all tasks finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl Events for NoopEvents {
    fn select(&self) -> Vec<RunnableEntry> {
        Vec::new()
    }

    fn interrupt(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_events_is_inert() {
        let events = NoopEvents;
        assert!(events.select().is_empty());
        events.interrupt();
        assert!(events.as_any().downcast_ref::<NoopEvents>().is_some());
    }
}
