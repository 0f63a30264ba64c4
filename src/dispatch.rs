//! Cross-domain dispatcher for parallel task submissions.
//!
//! The dispatcher is the single process-wide queue through which `call`
//! closures travel to another domain, plus the routing table that tracks
//! where each parallel task currently is (`Queued` or `Running(domain)`).
//! The routing table is what lets the cancellation engine reach a task
//! whose closure executes on a different domain than its promise's home.
//!
//! Routing policy:
//!
//! - a domain never dequeues a submission it originated (parallel means
//!   parallel)
//! - when parked eligible domains exist at submission time, one is chosen
//!   uniformly at random from the dispatcher's seeded PRNG and woken
//! - otherwise the submission stays queued and the first domain to reach
//!   quiescence picks it up
//!
//! Submissions whose cancel cell is already set at dequeue time are
//! discarded: their home record was settled `Cancelled` by the caller's
//! domain and running the closure would do work nobody can observe.

use crate::registry::{CancelCell, TaskClosure};
use crate::types::{DomainId, PromiseId};
use crate::util::DetRng;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// A parallel closure in flight to another domain.
pub(crate) struct Submission {
    pub id: PromiseId,
    pub origin: DomainId,
    pub cancel: Arc<CancelCell>,
    pub closure: TaskClosure,
}

impl core::fmt::Debug for Submission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Submission")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Where a parallel task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Queued,
    Running(DomainId),
}

#[derive(Debug, Default)]
struct DispatchState {
    queue: VecDeque<Submission>,
    routes: HashMap<PromiseId, Route>,
    parked: HashSet<DomainId>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The process-wide dispatcher.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    state: Mutex<DispatchState>,
    rng: Mutex<DetRng>,
}

impl Dispatcher {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            rng: Mutex::new(DetRng::new(seed)),
        }
    }

    /// Queues a submission. Returns a randomly chosen parked domain the
    /// caller should wake, if any is eligible.
    pub(crate) fn submit(&self, submission: Submission) -> Option<DomainId> {
        let mut state = self.state.lock();
        let id = submission.id;
        let origin = submission.origin;
        state.routes.insert(id, Route::Queued);
        state.queue.push_back(submission);

        let eligible: Vec<DomainId> = state
            .parked
            .iter()
            .copied()
            .filter(|d| *d != origin)
            .collect();
        let target = if eligible.is_empty() {
            None
        } else {
            let index = self.rng.lock().next_usize(eligible.len());
            Some(eligible[index])
        };
        if let Some(target) = target {
            // Unmark the chosen domain now, so back-to-back submissions
            // each wake a different sleeper instead of piling onto one.
            state.parked.remove(&target);
        }
        debug!(promise = %id, origin = %origin, target = ?target, "parallel submission queued");
        target
    }

    /// Dequeues the first eligible submission for `domain`: not originated
    /// by it and not already cancelled. Cancelled submissions encountered
    /// during the scan are dropped.
    pub(crate) fn try_dequeue(&self, domain: DomainId) -> Option<Submission> {
        let mut state = self.state.lock();
        let mut index = 0;
        while index < state.queue.len() {
            if state.queue[index].cancel.is_requested() {
                let dropped = state
                    .queue
                    .remove(index)
                    .expect("index bounded by queue length");
                state.routes.remove(&dropped.id);
                trace!(promise = %dropped.id, "cancelled submission discarded at dequeue");
                continue;
            }
            if state.queue[index].origin == domain {
                index += 1;
                continue;
            }
            let submission = state
                .queue
                .remove(index)
                .expect("index bounded by queue length");
            state.routes.insert(submission.id, Route::Running(domain));
            trace!(promise = %submission.id, domain = %domain, "parallel submission dequeued");
            return Some(submission);
        }
        None
    }

    /// Records where a cancel request must be forwarded.
    ///
    /// `None` means the task is still queued (or already finished): the
    /// shared cancel cell is enough and no cross-domain post is needed.
    /// `Some(domain)` means the closure is running there and the caller
    /// must post a cancel delivery to that domain.
    pub(crate) fn cancel_route(&self, id: PromiseId) -> Option<DomainId> {
        let mut state = self.state.lock();
        match state.routes.get(&id) {
            Some(Route::Queued) | None => {
                // Queued: the cell is checked at dequeue; drop the route so
                // a later finish is a no-op.
                state.routes.remove(&id);
                None
            }
            Some(Route::Running(domain)) => Some(*domain),
        }
    }

    /// Removes the routing entry once the execution domain posted the
    /// result.
    pub(crate) fn finish(&self, id: PromiseId) {
        self.state.lock().routes.remove(&id);
    }

    /// Marks `domain` as parked at quiescence, eligible for targeted
    /// wakeups.
    pub(crate) fn mark_parked(&self, domain: DomainId) {
        self.state.lock().parked.insert(domain);
    }

    /// Clears the parked mark.
    pub(crate) fn clear_parked(&self, domain: DomainId) {
        self.state.lock().parked.remove(&domain);
    }

    /// True if any submission is queued (parked domains re-check this
    /// before sleeping).
    pub(crate) fn has_queued(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ErasedValue;

    fn submission(id: u64, origin: u32) -> Submission {
        Submission {
            id: PromiseId::new_for_test(id),
            origin: DomainId(origin),
            cancel: Arc::new(CancelCell::new()),
            closure: Box::new(|_| Ok(Box::new(()) as ErasedValue)),
        }
    }

    #[test]
    fn dequeue_skips_own_submissions() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.submit(submission(1, 0));

        // The originating domain never gets its own closure back.
        assert!(dispatcher.try_dequeue(DomainId(0)).is_none());
        let got = dispatcher.try_dequeue(DomainId(1)).expect("eligible");
        assert_eq!(got.id, PromiseId::new_for_test(1));
    }

    #[test]
    fn dequeue_drops_cancelled_submissions() {
        let dispatcher = Dispatcher::new(1);
        let sub = submission(1, 0);
        let cell = Arc::clone(&sub.cancel);
        dispatcher.submit(sub);
        cell.request(crate::types::CancelReason::user("stop"));

        assert!(dispatcher.try_dequeue(DomainId(1)).is_none());
        assert!(!dispatcher.has_queued());
    }

    #[test]
    fn submit_targets_a_parked_eligible_domain() {
        let dispatcher = Dispatcher::new(7);
        dispatcher.mark_parked(DomainId(0));
        dispatcher.mark_parked(DomainId(2));

        // Domain 0 is the origin, so only domain 2 is eligible.
        let target = dispatcher.submit(submission(1, 0));
        assert_eq!(target, Some(DomainId(2)));

        // The chosen domain left the parked set; a second submission has
        // nobody eligible to wake and stays queued.
        assert_eq!(dispatcher.submit(submission(2, 0)), None);
    }

    #[test]
    fn cancel_route_tracks_running_domain() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.submit(submission(1, 0));
        let id = PromiseId::new_for_test(1);

        // Still queued: no forwarding needed.
        assert_eq!(dispatcher.cancel_route(id), None);

        // Re-queue and move to running.
        dispatcher.submit(submission(1, 0));
        let _ = dispatcher.try_dequeue(DomainId(1)).expect("dequeue");
        assert_eq!(dispatcher.cancel_route(id), Some(DomainId(1)));

        dispatcher.finish(id);
        assert_eq!(dispatcher.cancel_route(id), None);
    }

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn dispatcher_is_shareable() {
        _assert_send_sync::<Dispatcher>();
    }
}
