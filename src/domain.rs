//! Domain state and the per-domain scheduler loop.
//!
//! A domain is an OS thread running one scheduler loop over domain-local
//! state: its registry slice, its run queue, and its PRNG stream. The only
//! cross-domain traffic is (a) dispatcher submissions, (b) delivery posts
//! into the lock-free inbox, and (c) the interrupt flag flip; everything
//! else is mutated exclusively by the thread currently holding the
//! domain's baton.
//!
//! Loop discipline per iteration:
//!
//! 1. consume the interrupt token, drain deliveries (results, cancels)
//! 2. pop one random run-queue entry and execute it to its next
//!    suspension point
//! 3. if the queue is empty but pending promises remain, invoke the
//!    events source's `select`; on an empty return, park until interrupted
//! 4. if the domain is quiescent (no pending promises at all), pull
//!    parallel work from the dispatcher or park; workers exit here on
//!    shutdown

use crate::cancel::cancel_local;
use crate::dispatch::Submission;
use crate::events::{Events, RunnableEntry};
use crate::fiber::{Baton, Fiber, Turn};
use crate::ops::Cx;
use crate::registry::{
    discard_entry, CancelCell, ErasedOutcome, PromiseKind, PromiseRecord, PromiseState, Registry,
    ResumeSlot, TaskClosure,
};
use crate::runqueue::{ReadyEntry, RunQueue};
use crate::runtime::RuntimeShared;
use crate::types::{CancelReason, DomainId, PanicPayload, PromiseId};
use crate::util::DetRng;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// A cross-domain message drained by the owner's scheduler loop.
pub(crate) enum Delivery {
    /// A parallel task's outcome, posted by its execution domain.
    Result {
        id: PromiseId,
        outcome: ErasedOutcome,
    },
    /// A cancel request for a promise owned by this domain.
    Cancel { id: PromiseId, reason: CancelReason },
}

/// The domain-local mutable state.
///
/// Guarded by one mutex on [`DomainHandle`]; uncontended in steady state
/// because only the thread holding the domain's baton touches it.
pub(crate) struct DomainCore {
    pub registry: Registry,
    pub run_queue: RunQueue,
    pub rng: DetRng,
}

/// Shared handle to one domain.
pub(crate) struct DomainHandle {
    pub id: DomainId,
    pub core: Mutex<DomainCore>,
    pub inbox: SegQueue<Delivery>,
    pub events: Arc<dyn Events>,
    interrupt_flag: AtomicBool,
    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl DomainHandle {
    pub(crate) fn new(id: DomainId, rng_seed: u64, events: Arc<dyn Events>) -> Self {
        Self {
            id,
            core: Mutex::new(DomainCore {
                registry: Registry::new(),
                run_queue: RunQueue::new(),
                rng: DetRng::new(rng_seed),
            }),
            inbox: SegQueue::new(),
            events,
            interrupt_flag: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
        }
    }

    /// Forces this domain out of a blocking `select` or park.
    ///
    /// Callable from any thread; idempotent between consecutive wake-ups.
    pub(crate) fn interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::Release);
        self.events.interrupt();
        // Notify under the park lock so a concurrent parker cannot miss
        // the flag between its check and its wait.
        let _guard = self.park_lock.lock();
        self.park_cv.notify_all();
    }

    /// Consumes the interrupt token. Returns true if one was pending.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt_flag.swap(false, Ordering::AcqRel)
    }

    fn interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::Acquire)
    }

    /// Parks until the interrupt flag is raised. The flag is left set so
    /// the loop's next `take_interrupt` observes it.
    fn park(&self) {
        let mut guard = self.park_lock.lock();
        while !self.interrupted() {
            self.park_cv.wait(&mut guard);
        }
    }
}

impl core::fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Which loop variant a domain runs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Role {
    /// The main domain: exits once the root promise leaves `Pending`.
    Main { root: PromiseId },
    /// A worker: exits when quiescent after shutdown is flagged.
    Worker,
}

/// The scheduler loop. Runs on the domain's own thread until the exit
/// condition for `role` is met.
pub(crate) fn run_domain(rt: &Arc<RuntimeShared>, dom: &Arc<DomainHandle>, role: Role) {
    debug!(domain = %dom.id, "scheduler loop started");
    loop {
        dom.take_interrupt();
        drain_inbox(rt, dom);

        if let Role::Main { root } = role {
            let root_done = {
                let core = dom.core.lock();
                core.registry
                    .get(root)
                    .map_or(true, |rec| !rec.state.is_pending())
            };
            if root_done {
                break;
            }
        }

        let entry = {
            let mut core = dom.core.lock();
            let DomainCore {
                run_queue, rng, ..
            } = &mut *core;
            run_queue.pop_random(rng)
        };
        if let Some(entry) = entry {
            execute_entry(rt, dom, entry);
            continue;
        }

        let pending = dom.core.lock().registry.pending_count();
        if pending > 0 {
            // Not quiescent: some owned promise is suspended on external
            // events or on another domain. Ask the events source.
            let entries = dom.events.select();
            if entries.is_empty() {
                if !dom.interrupted() {
                    dom.park();
                }
                continue;
            }
            let mut core = dom.core.lock();
            for entry in entries {
                trace!(domain = %dom.id, promise = %entry.promise(), "events source returned entry");
                core.run_queue.push(ReadyEntry::Hook(entry));
            }
            continue;
        }

        // Quiescent: nothing owned is pending. Sleep on the dispatcher or
        // exit on shutdown.
        if rt.is_shutdown() {
            break;
        }
        rt.dispatcher.mark_parked(dom.id);
        if let Some(submission) = rt.dispatcher.try_dequeue(dom.id) {
            rt.dispatcher.clear_parked(dom.id);
            execute_submission(rt, dom, submission);
            continue;
        }
        if !dom.interrupted() && !rt.is_shutdown() && !rt.dispatcher.has_queued() {
            dom.park();
        }
        rt.dispatcher.clear_parked(dom.id);
    }
    debug!(domain = %dom.id, "scheduler loop exited");
}

/// Drains the delivery inbox: results settle home records, cancel posts
/// feed the cancellation engine.
fn drain_inbox(rt: &Arc<RuntimeShared>, dom: &Arc<DomainHandle>) {
    while let Some(delivery) = dom.inbox.pop() {
        match delivery {
            Delivery::Result { id, outcome } => {
                let mut core = dom.core.lock();
                let settled = core
                    .registry
                    .settle(id, PromiseState::from_outcome(outcome));
                if settled.changed {
                    trace!(domain = %dom.id, promise = %id, "parallel result delivered");
                    if let Some(waiter) = settled.waiter {
                        core.run_queue.push(ReadyEntry::Resume(waiter));
                    }
                }
                // Not changed: the home record was already cancelled (or
                // consumed); the stale value is dropped, never surfaced.
            }
            Delivery::Cancel { id, reason } => {
                let mut core = dom.core.lock();
                cancel_local(rt, &mut core, id, reason);
            }
        }
    }
}

fn execute_entry(rt: &Arc<RuntimeShared>, dom: &Arc<DomainHandle>, entry: ReadyEntry) {
    match entry {
        ReadyEntry::Start(id) => start_task(rt, dom, id),
        ReadyEntry::Resume(id) => resume_task(dom, id),
        ReadyEntry::Hook(entry) => run_hook_entry(dom, entry),
    }
}

/// Starts a queued task closure on a fresh fiber, unless it was cancelled
/// before it ever ran.
fn start_task(rt: &Arc<RuntimeShared>, dom: &Arc<DomainHandle>, id: PromiseId) {
    let started = {
        let mut core = dom.core.lock();
        let Some(rec) = core.registry.get_mut(id) else {
            return;
        };
        if !rec.state.is_pending() {
            return;
        }
        if rec.cancel.is_requested() {
            // Cancelled before the closure began: never execute it.
            rec.resume = ResumeSlot::Empty;
            let reason = rec.cancel.reason();
            trace!(domain = %dom.id, promise = %id, "task cancelled before start");
            let settled = core.registry.settle(id, PromiseState::Cancelled(reason));
            if let Some(waiter) = settled.waiter {
                core.run_queue.push(ReadyEntry::Resume(waiter));
            }
            return;
        }
        match mem::replace(&mut rec.resume, ResumeSlot::Running) {
            ResumeSlot::NotStarted(closure) => Some((closure, Arc::clone(&rec.cancel))),
            other => {
                rec.resume = other;
                None
            }
        }
    };
    if let Some((closure, cancel)) = started {
        spawn_and_drive(rt, dom, id, closure, cancel, None);
    }
}

/// Resumes a suspended fiber. Stale wake-ups (the record settled or was
/// consumed since the entry was queued) are discarded.
fn resume_task(dom: &Arc<DomainHandle>, id: PromiseId) {
    let fiber = {
        let mut core = dom.core.lock();
        let Some(rec) = core.registry.get_mut(id) else {
            return;
        };
        match mem::replace(&mut rec.resume, ResumeSlot::Running) {
            ResumeSlot::Suspended(fiber) => Some(fiber),
            other => {
                rec.resume = other;
                None
            }
        }
    };
    if let Some(fiber) = fiber {
        drive(dom, id, fiber);
    }
}

/// Runs a syscall resolution entry returned by the events source: the
/// bound closure, then the promise's `on_resolve` finalizer, inline on the
/// domain thread. Entries for promises that already left `Pending` are
/// discarded (the clean pass).
fn run_hook_entry(dom: &Arc<DomainHandle>, entry: RunnableEntry) {
    debug_assert_eq!(entry.home, dom.id);
    let id = entry.promise;
    let on_resolve = {
        let mut core = dom.core.lock();
        match core.registry.get_mut(id) {
            None => {
                discard_entry(entry);
                return;
            }
            Some(rec) if !rec.state.is_pending() => {
                trace!(domain = %dom.id, promise = %id, "stale events entry discarded");
                discard_entry(entry);
                return;
            }
            Some(rec) => {
                debug_assert_eq!(rec.kind, PromiseKind::Syscall);
                match rec.on_resolve.take() {
                    Some(on_resolve) => on_resolve,
                    None => {
                        error!(domain = %dom.id, promise = %id, "syscall promise has no finalizer");
                        return;
                    }
                }
            }
        }
    };

    (entry.work)();
    let state = match catch_unwind(AssertUnwindSafe(on_resolve)) {
        Ok(Ok(value)) => PromiseState::Resolved(value),
        Ok(Err(e)) => PromiseState::Failed(e),
        Err(payload) => PromiseState::Panicked(PanicPayload::from_panic(payload.as_ref())),
    };

    let mut core = dom.core.lock();
    trace!(domain = %dom.id, promise = %id, state = state.name(), "syscall promise settled");
    let settled = core.registry.settle(id, state);
    if let Some(waiter) = settled.waiter {
        core.run_queue.push(ReadyEntry::Resume(waiter));
    }
}

/// Runs a dequeued parallel submission: registers the execution record and
/// starts the closure on a fiber that will post its outcome home.
fn execute_submission(rt: &Arc<RuntimeShared>, dom: &Arc<DomainHandle>, submission: Submission) {
    let Submission {
        id,
        origin,
        cancel,
        closure,
    } = submission;
    if cancel.is_requested() {
        // Cancelled between dequeue scans; the home record is settled.
        rt.dispatcher.finish(id);
        return;
    }
    debug!(domain = %dom.id, promise = %id, origin = %origin, "parallel task starting");
    {
        let mut core = dom.core.lock();
        core.registry
            .insert(PromiseRecord::execution(id, Arc::clone(&cancel)));
    }
    spawn_and_drive(rt, dom, id, closure, cancel, Some(origin));
}

fn spawn_and_drive(
    rt: &Arc<RuntimeShared>,
    dom: &Arc<DomainHandle>,
    id: PromiseId,
    closure: TaskClosure,
    cancel: Arc<CancelCell>,
    reply_to: Option<DomainId>,
) {
    let baton = Baton::new();
    let cx = Cx::new(
        Arc::clone(rt),
        Arc::clone(dom),
        id,
        cancel,
        baton.clone(),
        reply_to,
    );
    let name = format!("{}-{}", rt.thread_name_prefix(), id);
    let fiber = Fiber::spawn(name, baton, cx, closure);
    drive(dom, id, fiber);
}

/// Hands the baton to a fiber and files it back into the registry when it
/// suspends, or joins its thread when it finishes.
fn drive(dom: &Arc<DomainHandle>, id: PromiseId, fiber: Fiber) {
    match fiber.resume() {
        Turn::Scheduler => {
            let mut core = dom.core.lock();
            match core.registry.get_mut(id) {
                Some(rec) => rec.resume = ResumeSlot::Suspended(fiber),
                None => {
                    // A suspended fiber's record is only removed after the
                    // fiber finished; reaching here is a runtime bug.
                    error!(domain = %dom.id, promise = %id, "suspended fiber has no record");
                }
            }
        }
        Turn::Done => fiber.join(),
        Turn::Task => unreachable!("fiber handed the baton back while holding it"),
    }
}
