//! The cancellation engine.
//!
//! Cancellation propagates strictly top-down: cancelling a promise cancels
//! every descendant; cancelling a child never affects the parent. Within a
//! domain the engine is a worklist walk over the local registry slice.
//! Parallel tasks are the only cross-domain edges: their home record is
//! settled `Cancelled` immediately (awaiters unblock without waiting for
//! the worker) and the request is forwarded to the execution domain
//! through the dispatcher's routing table, an inbox post, and an
//! interrupt.
//!
//! Per-case behavior, from the cancelled record's point of view:
//!
//! - task not yet started: transition straight to `Cancelled`; the closure
//!   is never executed and its queued `Start` entry dies in the clean pass
//! - task suspended: made runnable so its suspension-point operation
//!   observes the request and returns `Err(Cancelled)` into the closure
//! - task running (self-cancel): the shared cell is set; observed at the
//!   next suspension point
//! - syscall promise: settled `Cancelled`, waiter woken, `on_resolve`
//!   dropped unexecuted; a later events entry is discarded when popped

use crate::domain::{Delivery, DomainCore};
use crate::registry::{PromiseKind, PromiseState, ResumeSlot};
use crate::runqueue::ReadyEntry;
use crate::runtime::RuntimeShared;
use crate::types::{CancelReason, PromiseId};
use tracing::{debug, trace};

/// What the walk decided to do with one record.
enum Action {
    /// Settle `Cancelled` now (syscall, unstarted task, remote home).
    Settle,
    /// Wake a suspended fiber so it observes the request itself.
    WakeSuspended,
    /// Flag only; a running task observes at its next suspension point.
    FlagOnly,
}

/// Requests cancellation of `id` and all of its descendants reachable on
/// this domain. Must be called with the domain core locked by the current
/// holder of the domain's baton.
pub(crate) fn cancel_local(
    rt: &RuntimeShared,
    core: &mut DomainCore,
    id: PromiseId,
    reason: CancelReason,
) {
    let mut work = vec![(id, reason)];
    while let Some((id, reason)) = work.pop() {
        let decided = {
            let Some(rec) = core.registry.get_mut(id) else {
                continue;
            };
            if !rec.state.is_pending() {
                continue;
            }
            rec.cancel.request(reason.clone());
            let children: Vec<PromiseId> = rec.children.iter().copied().collect();
            let action = if rec.remote {
                Action::Settle
            } else {
                match rec.kind {
                    PromiseKind::Syscall => Action::Settle,
                    PromiseKind::Task => match &rec.resume {
                        ResumeSlot::NotStarted(_) => {
                            rec.resume = ResumeSlot::Empty;
                            Action::Settle
                        }
                        ResumeSlot::Suspended(_) => Action::WakeSuspended,
                        ResumeSlot::Running | ResumeSlot::Empty => Action::FlagOnly,
                    },
                }
            };
            (action, children, rec.remote)
        };
        let (action, children, remote) = decided;

        debug!(promise = %id, kind = %reason, remote, "cancel requested");
        for child in children {
            work.push((child, CancelReason::parent_cancelled()));
        }

        match action {
            Action::Settle => {
                let settled = core
                    .registry
                    .settle(id, PromiseState::Cancelled(reason.clone()));
                if let Some(waiter) = settled.waiter {
                    core.run_queue.push(ReadyEntry::Resume(waiter));
                }
                if remote {
                    // Forward to wherever the closure actually runs. A
                    // still-queued submission needs no post: the shared
                    // cell is checked at dequeue.
                    if let Some(exec_domain) = rt.dispatcher.cancel_route(id) {
                        trace!(promise = %id, exec = %exec_domain, "cancel forwarded to execution domain");
                        let target = rt.domain(exec_domain);
                        target.inbox.push(Delivery::Cancel { id, reason });
                        target.interrupt();
                    }
                }
            }
            Action::WakeSuspended => {
                core.run_queue.push(ReadyEntry::Resume(id));
            }
            Action::FlagOnly => {}
        }
    }
}
