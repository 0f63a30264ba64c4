//! Per-domain promise registry.
//!
//! Each domain owns one [`Registry`]: the slice of the process-wide promise
//! graph whose records live on that domain. A record carries the promise
//! state machine, the parent/child edges (stored as ids, so the graph has
//! no ownership cycles), the suspended continuation for task promises, and
//! the `on_resolve` finalizer for syscall promises.
//!
//! State machine invariants enforced here:
//!
//! - a record leaves `Pending` at most once ([`Registry::settle`] is a
//!   no-op on terminal records)
//! - consumption removes the record; an absent record is the `Consumed`
//!   state and a re-await reports `AlreadyConsumed`
//! - the pending count tracked per domain drives the quiescence protocol

use crate::error::{Error, Result};
use crate::events::RunnableEntry;
use crate::fiber::Fiber;
use crate::ops::Cx;
use crate::types::{CancelReason, Outcome, PanicPayload, PromiseId};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Type-erased value carried by a resolved promise.
pub(crate) type ErasedValue = Box<dyn Any + Send>;

/// Type-erased outcome moved between domains and out of the registry.
pub(crate) type ErasedOutcome = Outcome<ErasedValue>;

/// A task closure, erased to the registry's value representation.
pub(crate) type TaskClosure = Box<dyn FnOnce(&Cx) -> Result<ErasedValue> + Send>;

/// A syscall promise's value-producing finalizer.
pub(crate) type OnResolve = Box<dyn FnOnce() -> Result<ErasedValue> + Send>;

/// Shared cancellation cell, observed by the running closure.
///
/// For a parallel task the same cell is shared by the home record, the
/// dispatcher submission, and the execution record, so a cancel request is
/// visible on the worker even before the cross-domain post is drained.
#[derive(Debug, Default)]
pub(crate) struct CancelCell {
    requested: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a cancellation request, strengthening any existing reason.
    pub(crate) fn request(&self, reason: CancelReason) {
        let mut guard = self.reason.lock();
        match guard.as_mut() {
            Some(existing) => {
                existing.strengthen(&reason);
            }
            None => *guard = Some(reason),
        }
        self.requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Returns the recorded reason, or the default if none was stored.
    pub(crate) fn reason(&self) -> CancelReason {
        self.reason.lock().clone().unwrap_or_default()
    }
}

/// Whether a promise is backed by a closure or by external resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromiseKind {
    /// Has an associated closure the scheduler runs.
    Task,
    /// No closure; resolved through the events interface.
    Syscall,
}

/// The state of a promise.
///
/// `Consumed` has no variant: consuming an outcome removes the record, and
/// an absent record reports `AlreadyConsumed` on re-await.
pub(crate) enum PromiseState {
    Pending,
    Resolved(ErasedValue),
    Failed(Error),
    Cancelled(CancelReason),
    Panicked(PanicPayload),
}

impl PromiseState {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub(crate) fn from_outcome(outcome: ErasedOutcome) -> Self {
        match outcome {
            Outcome::Resolved(v) => Self::Resolved(v),
            Outcome::Failed(e) => Self::Failed(e),
            Outcome::Cancelled(r) => Self::Cancelled(r),
            Outcome::Panicked(p) => Self::Panicked(p),
        }
    }

    /// Moves a terminal state out as an outcome. `None` for `Pending`.
    pub(crate) fn into_outcome(self) -> Option<ErasedOutcome> {
        match self {
            Self::Pending => None,
            Self::Resolved(v) => Some(Outcome::Resolved(v)),
            Self::Failed(e) => Some(Outcome::Failed(e)),
            Self::Cancelled(r) => Some(Outcome::Cancelled(r)),
            Self::Panicked(p) => Some(Outcome::Panicked(p)),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Resolved(_) => "Resolved",
            Self::Failed(_) => "Failed",
            Self::Cancelled(_) => "Cancelled",
            Self::Panicked(_) => "Panicked",
        }
    }
}

impl core::fmt::Debug for PromiseState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// The continuation slot of a task record.
pub(crate) enum ResumeSlot {
    /// Closure not yet begun; queued as a `Start` entry.
    NotStarted(TaskClosure),
    /// Fiber parked at a suspension point.
    Suspended(Fiber),
    /// Fiber currently held by the scheduler (executing).
    Running,
    /// No continuation (syscall promises, finished tasks).
    Empty,
}

impl core::fmt::Debug for ResumeSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::NotStarted(_) => "NotStarted",
            Self::Suspended(_) => "Suspended",
            Self::Running => "Running",
            Self::Empty => "Empty",
        })
    }
}

/// One promise record in a domain's registry slice.
pub(crate) struct PromiseRecord {
    pub id: PromiseId,
    pub kind: PromiseKind,
    pub state: PromiseState,
    pub parent: Option<PromiseId>,
    pub children: BTreeSet<PromiseId>,
    pub resume: ResumeSlot,
    pub on_resolve: Option<OnResolve>,
    /// The task awaiting this promise (at most one; single-await).
    pub waiter: Option<PromiseId>,
    pub cancel: Arc<CancelCell>,
    /// Home facet of a parallel task: execution happens on another domain.
    pub remote: bool,
}

impl PromiseRecord {
    /// A concurrent task record with its closure queued to start.
    pub(crate) fn task(
        id: PromiseId,
        parent: Option<PromiseId>,
        closure: TaskClosure,
        cancel: Arc<CancelCell>,
    ) -> Self {
        Self {
            id,
            kind: PromiseKind::Task,
            state: PromiseState::Pending,
            parent,
            children: BTreeSet::new(),
            resume: ResumeSlot::NotStarted(closure),
            on_resolve: None,
            waiter: None,
            cancel,
            remote: false,
        }
    }

    /// The home facet of a parallel task; the closure runs elsewhere.
    pub(crate) fn remote_home(
        id: PromiseId,
        parent: Option<PromiseId>,
        cancel: Arc<CancelCell>,
    ) -> Self {
        Self {
            id,
            kind: PromiseKind::Task,
            state: PromiseState::Pending,
            parent,
            children: BTreeSet::new(),
            resume: ResumeSlot::Empty,
            on_resolve: None,
            waiter: None,
            cancel,
            remote: true,
        }
    }

    /// The execution facet of a parallel task on the worker domain.
    pub(crate) fn execution(id: PromiseId, cancel: Arc<CancelCell>) -> Self {
        Self {
            id,
            kind: PromiseKind::Task,
            state: PromiseState::Pending,
            parent: None,
            children: BTreeSet::new(),
            resume: ResumeSlot::Running,
            on_resolve: None,
            waiter: None,
            cancel,
            remote: false,
        }
    }

    /// A syscall promise with its value-producing finalizer.
    pub(crate) fn syscall(
        id: PromiseId,
        parent: Option<PromiseId>,
        on_resolve: OnResolve,
        cancel: Arc<CancelCell>,
    ) -> Self {
        Self {
            id,
            kind: PromiseKind::Syscall,
            state: PromiseState::Pending,
            parent,
            children: BTreeSet::new(),
            resume: ResumeSlot::Empty,
            on_resolve: Some(on_resolve),
            waiter: None,
            cancel,
            remote: false,
        }
    }
}

/// Result of a [`Registry::settle`] call.
pub(crate) struct Settled {
    /// False if the record was absent or already terminal.
    pub changed: bool,
    /// The waiter to make runnable, if one was registered.
    pub waiter: Option<PromiseId>,
}

/// One domain's slice of the promise graph.
#[derive(Default)]
pub(crate) struct Registry {
    records: HashMap<PromiseId, PromiseRecord>,
    pending: usize,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of records still in `Pending` state on this domain.
    ///
    /// Drives quiescence: a domain with zero pending promises and an empty
    /// run queue may sleep on the dispatcher.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending
    }

    pub(crate) fn insert(&mut self, record: PromiseRecord) {
        debug_assert!(record.state.is_pending());
        debug_assert!(!self.records.contains_key(&record.id));
        self.pending += 1;
        self.records.insert(record.id, record);
    }

    pub(crate) fn get(&self, id: PromiseId) -> Option<&PromiseRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: PromiseId) -> Option<&mut PromiseRecord> {
        self.records.get_mut(&id)
    }

    /// Removes a record, maintaining the pending count.
    pub(crate) fn remove(&mut self, id: PromiseId) -> Option<PromiseRecord> {
        let record = self.records.remove(&id)?;
        if record.state.is_pending() {
            self.pending -= 1;
        }
        Some(record)
    }

    /// Transitions a record out of `Pending` exactly once.
    ///
    /// Returns the registered waiter so the caller can make it runnable.
    /// No-op (`changed == false`) if the record is absent or already
    /// terminal: a promise leaves `Pending` at most once.
    pub(crate) fn settle(&mut self, id: PromiseId, state: PromiseState) -> Settled {
        debug_assert!(!state.is_pending());
        let Some(record) = self.records.get_mut(&id) else {
            return Settled {
                changed: false,
                waiter: None,
            };
        };
        if !record.state.is_pending() {
            return Settled {
                changed: false,
                waiter: None,
            };
        }
        record.state = state;
        record.on_resolve = None;
        if matches!(record.resume, ResumeSlot::Suspended(_)) {
            // A parked fiber must be woken, never dropped; suspended tasks
            // settle through their own trampoline.
            debug_assert!(false, "settle on a suspended fiber");
        } else {
            record.resume = ResumeSlot::Empty;
        }
        self.pending -= 1;
        Settled {
            changed: true,
            waiter: record.waiter.take(),
        }
    }

    /// Detaches `child` from its parent's children set, if the parent is
    /// still present on this domain.
    pub(crate) fn detach_child(&mut self, parent: Option<PromiseId>, child: PromiseId) {
        if let Some(parent) = parent {
            if let Some(record) = self.records.get_mut(&parent) {
                record.children.remove(&child);
            }
        }
    }
}

/// Downcasts an erased outcome back to its typed form.
pub(crate) fn downcast_outcome<T: 'static>(outcome: ErasedOutcome) -> Result<Outcome<T>> {
    match outcome {
        Outcome::Resolved(v) => match v.downcast::<T>() {
            Ok(v) => Ok(Outcome::Resolved(*v)),
            Err(_) => Err(Error::internal("promise value type mismatch")),
        },
        Outcome::Failed(e) => Ok(Outcome::Failed(e)),
        Outcome::Cancelled(r) => Ok(Outcome::Cancelled(r)),
        Outcome::Panicked(p) => Ok(Outcome::Panicked(p)),
    }
}

/// Discard wrapper for entries the clean pass throws away; keeps the intent
/// greppable at call sites.
pub(crate) fn discard_entry(entry: RunnableEntry) {
    drop(entry);
}
