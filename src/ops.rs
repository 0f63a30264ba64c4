//! The task context and the public operations surface.
//!
//! Every task closure receives a [`Cx`] by reference; all effects flow
//! through it — creating tasks and syscall promises, awaiting, cancelling,
//! yielding. There is no ambient authority: a closure without a `Cx`
//! cannot touch the scheduler.
//!
//! The suspension points of the runtime are exactly the operations here
//! that hand the baton to the scheduler: [`Cx::wait`] (and its `wait_all`
//! / `wait_first` / [`Cx::suspend`] variants), [`Cx::yield_now`], and task
//! return. Each of them observes a pending cancellation request and
//! reports it as `Err(Cancelled)` so it propagates out of the closure with
//! `?`.

use crate::cancel::cancel_local;
use crate::dispatch::Submission;
use crate::domain::{Delivery, DomainHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Events, RunnableEntry};
use crate::fiber::Baton;
use crate::registry::{
    downcast_outcome, CancelCell, ErasedOutcome, ErasedValue, OnResolve, PromiseRecord,
    PromiseState, TaskClosure,
};
use crate::runqueue::ReadyEntry;
use crate::runtime::RuntimeShared;
use crate::types::{CancelReason, DomainId, Outcome, PanicPayload, PromiseId};
use core::fmt;
use core::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

/// A handle to the eventual outcome of a task or syscall promise.
///
/// The handle is legal to use only on its *home* domain — the domain it
/// was created on; operations from elsewhere fail with `ForeignPromise`.
/// A promise resolves at most once and its outcome is consumed at most
/// once; a second await reports `AlreadyConsumed`.
pub struct Promise<T> {
    id: PromiseId,
    home: DomainId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Promise<T> {
    pub(crate) fn new(id: PromiseId, home: DomainId) -> Self {
        Self {
            id,
            home,
            _marker: PhantomData,
        }
    }

    /// The stable, process-wide unique id of this promise.
    #[must_use]
    pub fn id(&self) -> PromiseId {
        self.id
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            home: self.home,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("home", &self.home)
            .finish()
    }
}

/// The capability context of a running task.
///
/// Passed by reference into every task closure; carries the identity of
/// the current task, its domain, its cancellation cell, and the baton that
/// implements its suspension points.
pub struct Cx {
    rt: Arc<RuntimeShared>,
    dom: Arc<DomainHandle>,
    task: PromiseId,
    cancel: Arc<CancelCell>,
    baton: Baton,
    reply_to: Option<DomainId>,
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("task", &self.task)
            .field("domain", &self.dom.id)
            .finish_non_exhaustive()
    }
}

impl Cx {
    pub(crate) fn new(
        rt: Arc<RuntimeShared>,
        dom: Arc<DomainHandle>,
        task: PromiseId,
        cancel: Arc<CancelCell>,
        baton: Baton,
        reply_to: Option<DomainId>,
    ) -> Self {
        Self {
            rt,
            dom,
            task,
            cancel,
            baton,
            reply_to,
        }
    }

    /// The domain this task runs on.
    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.dom.id
    }

    /// The events source of the current domain, for consumers that need
    /// to downcast to a concrete source (see [`crate::time`]).
    #[must_use]
    pub fn events(&self) -> &dyn Events {
        self.dom.events.as_ref()
    }

    /// True if cancellation of the current task has been requested.
    ///
    /// Long computations can poll this between suspension points.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Submits `f` to the dispatcher as a parallel task: it will run on
    /// some domain other than this one. The result is delivered back to
    /// this domain and consumed with [`Cx::wait`].
    ///
    /// Fails with `EmptyDomainPool` when no worker domains exist.
    pub fn call<T, F>(&self, f: F) -> Result<Promise<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Cx) -> Result<T> + Send + 'static,
    {
        if self.rt.domain_count() <= 1 {
            return Err(Error::new(ErrorKind::EmptyDomainPool)
                .with_context("call requires at least one worker domain"));
        }
        let id = PromiseId::next();
        let cancel = Arc::new(CancelCell::new());
        {
            let mut core = self.dom.core.lock();
            core.registry.insert(PromiseRecord::remote_home(
                id,
                Some(self.task),
                Arc::clone(&cancel),
            ));
            if let Some(parent) = core.registry.get_mut(self.task) {
                parent.children.insert(id);
            }
        }
        let closure: TaskClosure = Box::new(move |cx| f(cx).map(|v| Box::new(v) as ErasedValue));
        let target = self.rt.dispatcher.submit(Submission {
            id,
            origin: self.dom.id,
            cancel,
            closure,
        });
        if let Some(target) = target {
            self.rt.domain(target).interrupt();
        }
        debug!(task = %self.task, promise = %id, "parallel task submitted");
        Ok(Promise::new(id, self.dom.id))
    }

    /// Enqueues `f` as a concurrent task on the current domain. It
    /// interleaves with this task at suspension points only.
    pub fn call_cc<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(&Cx) -> Result<T> + Send + 'static,
    {
        let id = PromiseId::next();
        let cancel = Arc::new(CancelCell::new());
        let closure: TaskClosure = Box::new(move |cx| f(cx).map(|v| Box::new(v) as ErasedValue));
        let mut core = self.dom.core.lock();
        core.registry
            .insert(PromiseRecord::task(id, Some(self.task), closure, cancel));
        if let Some(parent) = core.registry.get_mut(self.task) {
            parent.children.insert(id);
        }
        core.run_queue.push(ReadyEntry::Start(id));
        debug!(task = %self.task, promise = %id, "concurrent task enqueued");
        Promise::new(id, self.dom.id)
    }

    /// Creates a syscall promise: a promise resolved by external code
    /// through the events interface. `on_resolve` runs once, on this
    /// domain, when the promise resolves; its return value becomes the
    /// resolved value.
    pub fn make<T, F>(&self, on_resolve: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let id = PromiseId::next();
        let cancel = Arc::new(CancelCell::new());
        let on_resolve: OnResolve =
            Box::new(move || on_resolve().map(|v| Box::new(v) as ErasedValue));
        let mut core = self.dom.core.lock();
        core.registry.insert(PromiseRecord::syscall(
            id,
            Some(self.task),
            on_resolve,
            cancel,
        ));
        if let Some(parent) = core.registry.get_mut(self.task) {
            parent.children.insert(id);
        }
        trace!(task = %self.task, promise = %id, "syscall promise created");
        Promise::new(id, self.dom.id)
    }

    /// Packages `(syscall promise, closure)` as a runnable entry for the
    /// events source to return from `select`.
    pub fn task<T>(
        &self,
        p: &Promise<T>,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<RunnableEntry> {
        self.ensure_home(p)?;
        Ok(RunnableEntry {
            promise: p.id,
            home: self.dom.id,
            work: Box::new(work),
        })
    }

    /// The stable id of `p`.
    #[must_use]
    pub fn uid<T>(&self, p: &Promise<T>) -> PromiseId {
        p.id
    }

    /// True iff `p` is still `Pending`. A consumed promise reports false.
    pub fn is_pending<T>(&self, p: &Promise<T>) -> Result<bool> {
        self.ensure_home(p)?;
        let core = self.dom.core.lock();
        Ok(core
            .registry
            .get(p.id)
            .is_some_and(|rec| rec.state.is_pending()))
    }

    /// Requests cancellation of `p` and all of its descendants.
    pub fn cancel<T>(&self, p: &Promise<T>) -> Result<()> {
        self.ensure_home(p)?;
        let mut core = self.dom.core.lock();
        cancel_local(
            &self.rt,
            &mut core,
            p.id,
            CancelReason::user("cancel requested"),
        );
        Ok(())
    }

    /// Voluntary suspension point: other ready tasks on this domain run
    /// before this one continues.
    pub fn yield_now(&self) -> Result<()> {
        if self.cancel.is_requested() {
            return Err(Error::cancelled(&self.cancel.reason()));
        }
        {
            let mut core = self.dom.core.lock();
            core.run_queue.push(ReadyEntry::Resume(self.task));
        }
        self.baton.yield_to_scheduler();
        if self.cancel.is_requested() {
            return Err(Error::cancelled(&self.cancel.reason()));
        }
        Ok(())
    }

    /// Parks the current task until `p` leaves `Pending` and consumes its
    /// outcome. The companion of [`Cx::make`] for syscall promises.
    pub fn suspend<T: 'static>(&self, p: &Promise<T>) -> Result<Outcome<T>> {
        self.wait(p)
    }

    /// Consumes the outcome of `p`, parking until it leaves `Pending`.
    ///
    /// This operation is promise `await`; the name is `wait` because
    /// `await` is a Rust keyword. Fails with `AlreadyConsumed` on a second wait, with
    /// `ForeignPromise` from a non-home domain, and with `Cancelled` if
    /// the *current* task is cancelled while waiting.
    pub fn wait<T: 'static>(&self, p: &Promise<T>) -> Result<Outcome<T>> {
        self.ensure_home(p)?;
        let erased = self.wait_erased(p.id)?;
        downcast_outcome(erased)
    }

    /// Consumes the outcomes of all `ps`, in input order.
    ///
    /// The list must be non-empty (`EmptyAwait` otherwise); this
    /// precondition is load-bearing for callers that treat "all results
    /// arrived" as progress.
    pub fn wait_all<T: 'static>(&self, ps: &[Promise<T>]) -> Result<Vec<Outcome<T>>> {
        if ps.is_empty() {
            return Err(Error::new(ErrorKind::EmptyAwait).with_context("wait_all of no promises"));
        }
        let mut outcomes = Vec::with_capacity(ps.len());
        for p in ps {
            outcomes.push(self.wait(p)?);
        }
        Ok(outcomes)
    }

    /// Waits for the first of `ps` to complete, consumes its outcome, and
    /// cancels all the others. Returns the winner's index and outcome.
    ///
    /// The list must be non-empty (`EmptyAwait` otherwise).
    pub fn wait_first<T: 'static>(&self, ps: &[Promise<T>]) -> Result<(usize, Outcome<T>)> {
        if ps.is_empty() {
            return Err(Error::new(ErrorKind::EmptyAwait).with_context("wait_first of no promises"));
        }
        for p in ps {
            self.ensure_home(p)?;
        }
        loop {
            {
                let mut core = self.dom.core.lock();
                if self.cancel.is_requested() {
                    for p in ps {
                        if let Some(rec) = core.registry.get_mut(p.id) {
                            if rec.waiter == Some(self.task) {
                                rec.waiter = None;
                            }
                        }
                    }
                    return Err(Error::cancelled(&self.cancel.reason()));
                }

                let mut winner = None;
                for (index, p) in ps.iter().enumerate() {
                    match core.registry.get(p.id) {
                        None => {
                            return Err(Error::new(ErrorKind::AlreadyConsumed)
                                .with_context(format!("promise {} already consumed", p.id)));
                        }
                        Some(rec) if !rec.state.is_pending() => {
                            winner = Some(index);
                            break;
                        }
                        Some(_) => {}
                    }
                }

                if let Some(index) = winner {
                    for (other, p) in ps.iter().enumerate() {
                        if other != index {
                            if let Some(rec) = core.registry.get_mut(p.id) {
                                if rec.waiter == Some(self.task) {
                                    rec.waiter = None;
                                }
                            }
                        }
                    }
                    let outcome = consume(&mut core, ps[index].id)?;
                    for (other, p) in ps.iter().enumerate() {
                        if other != index {
                            cancel_local(&self.rt, &mut core, p.id, CancelReason::race_lost());
                        }
                    }
                    trace!(task = %self.task, winner = %ps[index].id, "wait_first settled");
                    return Ok((index, downcast_outcome(outcome)?));
                }

                for p in ps {
                    let Some(rec) = core.registry.get_mut(p.id) else {
                        continue;
                    };
                    if let Some(waiter) = rec.waiter {
                        if waiter != self.task {
                            return Err(Error::new(ErrorKind::AlreadyConsumed)
                                .with_context(format!("promise {} already awaited", p.id)));
                        }
                    }
                    rec.waiter = Some(self.task);
                }
            }
            self.baton.yield_to_scheduler();
        }
    }

    fn ensure_home<T>(&self, p: &Promise<T>) -> Result<()> {
        if p.home == self.dom.id {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ForeignPromise).with_context(format!(
                "promise {} belongs to {}, current domain is {}",
                p.id, p.home, self.dom.id
            )))
        }
    }

    /// Core wait loop over the erased registry representation.
    ///
    /// Parent finalization does not come through here: it must collect
    /// children even while itself cancelled, so it runs its own loop.
    fn wait_erased(&self, id: PromiseId) -> Result<ErasedOutcome> {
        if id == self.task {
            return Err(Error::internal("a task cannot await its own promise"));
        }
        loop {
            {
                let mut core = self.dom.core.lock();
                if self.cancel.is_requested() {
                    if let Some(rec) = core.registry.get_mut(id) {
                        if rec.waiter == Some(self.task) {
                            rec.waiter = None;
                        }
                    }
                    return Err(Error::cancelled(&self.cancel.reason()));
                }
                match core.registry.get(id) {
                    None => {
                        return Err(Error::new(ErrorKind::AlreadyConsumed)
                            .with_context(format!("promise {id} already consumed")));
                    }
                    Some(rec) if !rec.state.is_pending() => {
                        return consume(&mut core, id);
                    }
                    Some(rec) => {
                        if let Some(waiter) = rec.waiter {
                            if waiter != self.task {
                                return Err(Error::new(ErrorKind::AlreadyConsumed)
                                    .with_context(format!("promise {id} already awaited")));
                            }
                        }
                    }
                }
                if let Some(rec) = core.registry.get_mut(id) {
                    rec.waiter = Some(self.task);
                }
            }
            self.baton.yield_to_scheduler();
        }
    }
}

/// Removes a terminal record and moves its outcome out, detaching it from
/// its parent's children set. The registry-level `Consumed` transition.
fn consume(
    core: &mut crate::domain::DomainCore,
    id: PromiseId,
) -> Result<ErasedOutcome> {
    let Some(rec) = core.registry.remove(id) else {
        return Err(Error::new(ErrorKind::AlreadyConsumed));
    };
    core.registry.detach_child(rec.parent, id);
    rec.state
        .into_outcome()
        .ok_or_else(|| Error::internal("consume of a pending promise"))
}

/// The fiber trampoline: runs the task closure, finalizes children, and
/// publishes the outcome.
///
/// Task return is a suspension point: a cancel request that was never
/// observed inside the closure still turns the outcome into `Cancelled`
/// here, and pending children are cancelled and collected before the
/// parent's promise leaves `Pending` — a parent never resolves over a
/// live child.
pub(crate) fn run_task_body(cx: &Cx, closure: TaskClosure) {
    trace!(task = %cx.task, domain = %cx.dom.id, "task started");
    let result = catch_unwind(AssertUnwindSafe(|| closure(cx)));
    finalize_children(cx);

    let outcome: ErasedOutcome = if cx.cancel.is_requested() {
        Outcome::Cancelled(cx.cancel.reason())
    } else {
        match result {
            Ok(Ok(value)) => Outcome::Resolved(value),
            Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                Outcome::Cancelled(cx.cancel.reason())
            }
            Ok(Err(e)) => Outcome::Failed(e),
            Err(payload) => Outcome::Panicked(PanicPayload::from_panic(payload.as_ref())),
        }
    };

    publish_outcome(cx, outcome);
}

/// Cancels still-pending children, waits for every remaining child to
/// reach a terminal state, and destroys their records.
fn finalize_children(cx: &Cx) {
    let children: Vec<PromiseId> = {
        let core = cx.dom.core.lock();
        core.registry
            .get(cx.task)
            .map(|rec| rec.children.iter().copied().collect())
            .unwrap_or_default()
    };
    if children.is_empty() {
        return;
    }
    debug!(task = %cx.task, count = children.len(), "finalizing children");
    {
        let mut core = cx.dom.core.lock();
        for &child in &children {
            cancel_local(&cx.rt, &mut core, child, CancelReason::parent_cancelled());
        }
    }
    for &child in &children {
        loop {
            {
                let mut core = cx.dom.core.lock();
                match core.registry.get(child) {
                    None => break,
                    Some(rec) if !rec.state.is_pending() => {
                        drop(core.registry.remove(child));
                        break;
                    }
                    Some(rec) => {
                        if rec.waiter.is_none() || rec.waiter == Some(cx.task) {
                            if let Some(rec) = core.registry.get_mut(child) {
                                rec.waiter = Some(cx.task);
                            }
                        } else {
                            // Someone else awaits this child; poll instead
                            // of stealing their waiter slot.
                            core.run_queue.push(ReadyEntry::Resume(cx.task));
                        }
                    }
                }
            }
            cx.baton.yield_to_scheduler();
        }
    }
    let mut core = cx.dom.core.lock();
    if let Some(rec) = core.registry.get_mut(cx.task) {
        rec.children.clear();
    }
}

fn publish_outcome(cx: &Cx, outcome: ErasedOutcome) {
    let label = match &outcome {
        Outcome::Resolved(_) => "Resolved",
        Outcome::Failed(_) => "Failed",
        Outcome::Cancelled(_) => "Cancelled",
        Outcome::Panicked(_) => "Panicked",
    };
    if let Some(origin) = cx.reply_to {
        // Execution facet of a parallel task: drop the local record and
        // post the outcome home.
        {
            let mut core = cx.dom.core.lock();
            core.registry.remove(cx.task);
        }
        cx.rt.dispatcher.finish(cx.task);
        let target = cx.rt.domain(origin);
        target.inbox.push(Delivery::Result {
            id: cx.task,
            outcome,
        });
        target.interrupt();
        debug!(task = %cx.task, origin = %origin, outcome = label, "parallel task finished, result posted");
    } else {
        let mut core = cx.dom.core.lock();
        let settled = core
            .registry
            .settle(cx.task, PromiseState::from_outcome(outcome));
        if let Some(waiter) = settled.waiter {
            core.run_queue.push(ReadyEntry::Resume(waiter));
        }
        debug!(task = %cx.task, outcome = label, "task finished");
    }
}
