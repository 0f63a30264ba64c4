//! A timer events source and `sleep`, the canonical events consumer.
//!
//! The core scheduler has no notion of time; this module supplies it from
//! the outside through the [`Events`](crate::events::Events) interface, the
//! same way a Unix I/O extension would supply readiness on file
//! descriptors. [`TimerEvents`] keeps a min-heap of deadlines per domain;
//! its `select` blocks until the nearest deadline or an interrupt, with the
//! wait clamped to zero when the deadline already passed, and returns the
//! due entries for the scheduler to run.

use crate::error::{Error, Result};
use crate::events::{Events, RunnableEntry};
use crate::ops::Cx;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tracing::trace;

struct TimerEntry {
    at: Instant,
    seq: u64,
    entry: RunnableEntry,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top. Sequence numbers break ties by registration
        // order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<TimerEntry>,
    next_seq: u64,
    wakeup: bool,
}

/// Per-domain timer events source.
///
/// Install with [`Builder::events`](crate::runtime::Builder::events):
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tandem::{time, Builder};
///
/// Builder::new()
///     .events(|_| Arc::new(time::TimerEvents::new()))
///     .run(|cx| time::sleep(cx, Duration::from_millis(10)))
///     .unwrap();
/// ```
#[derive(Default)]
pub struct TimerEvents {
    state: Mutex<TimerState>,
    cv: Condvar,
}

impl TimerEvents {
    /// Creates an empty timer events source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` to become runnable at `deadline`.
    pub fn register(&self, deadline: Instant, entry: RunnableEntry) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        trace!(promise = %entry.promise(), "timer deadline registered");
        state.deadlines.push(TimerEntry {
            at: deadline,
            seq,
            entry,
        });
        self.cv.notify_all();
    }

    /// Number of deadlines not yet fired (for diagnostics and tests).
    #[must_use]
    pub fn armed(&self) -> usize {
        self.state.lock().deadlines.len()
    }
}

impl Events for TimerEvents {
    fn select(&self) -> Vec<RunnableEntry> {
        let mut state = self.state.lock();
        loop {
            if state.wakeup {
                state.wakeup = false;
                return Vec::new();
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while state
                .deadlines
                .peek()
                .is_some_and(|timer| timer.at <= now)
            {
                if let Some(timer) = state.deadlines.pop() {
                    due.push(timer.entry);
                }
            }
            if !due.is_empty() {
                return due;
            }
            match state.deadlines.peek().map(|timer| timer.at) {
                None => self.cv.wait(&mut state),
                Some(at) => {
                    // Clamped to zero: an already-passed deadline fires on
                    // the next loop turn instead of sleeping.
                    let timeout = at.saturating_duration_since(now);
                    if timeout.is_zero() {
                        continue;
                    }
                    let _ = self.cv.wait_for(&mut state, timeout);
                }
            }
        }
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.wakeup = true;
        self.cv.notify_all();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl core::fmt::Debug for TimerEvents {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerEvents")
            .field("armed", &self.armed())
            .finish()
    }
}

/// Parks the current task for `duration`.
///
/// Built entirely from the public surface: a syscall promise, a runnable
/// entry registered with the domain's [`TimerEvents`], and `suspend`.
/// Returns `Err(Cancelled)` if the task is cancelled mid-sleep, so `?`
/// propagates cancellation out of the closure.
pub fn sleep(cx: &Cx, duration: Duration) -> Result<()> {
    let Some(timer) = cx.events().as_any().downcast_ref::<TimerEvents>() else {
        return Err(Error::internal(
            "sleep requires TimerEvents installed on this domain",
        ));
    };
    let p = cx.make(|| Ok(()));
    let entry = cx.task(&p, || ())?;
    timer.register(Instant::now() + duration, entry);
    cx.suspend(&p)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn interrupt_unblocks_empty_select() {
        let timer = Arc::new(TimerEvents::new());
        let selecting = Arc::clone(&timer);
        let handle = thread::spawn(move || selecting.select());

        // Give the select a moment to block, then interrupt it.
        thread::sleep(Duration::from_millis(20));
        timer.interrupt();
        let entries = handle.join().expect("select thread");
        assert!(entries.is_empty());
    }

    #[test]
    fn interrupt_token_is_consumed_by_one_select() {
        let timer = TimerEvents::new();
        timer.interrupt();
        timer.interrupt();
        assert!(timer.select().is_empty());
        // Token consumed: the next select must block again.
        let timer = Arc::new(timer);
        let selecting = Arc::clone(&timer);
        let handle = thread::spawn(move || selecting.select());
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        timer.interrupt();
        handle.join().expect("select thread");
    }

    #[test]
    fn past_deadline_fires_without_sleeping() {
        let timer = TimerEvents::new();
        let entry = RunnableEntry {
            promise: crate::types::PromiseId::new_for_test(1),
            home: crate::types::DomainId(0),
            work: Box::new(|| {}),
        };
        timer.register(Instant::now() - Duration::from_secs(1), entry);

        let started = Instant::now();
        let due = timer.select();
        assert_eq!(due.len(), 1);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(timer.armed(), 0);
    }

    #[test]
    fn deadlines_fire_in_order() {
        let timer = TimerEvents::new();
        let entry = |n: u64| RunnableEntry {
            promise: crate::types::PromiseId::new_for_test(n),
            home: crate::types::DomainId(0),
            work: Box::new(|| {}),
        };
        let now = Instant::now();
        timer.register(now + Duration::from_millis(30), entry(2));
        timer.register(now + Duration::from_millis(5), entry(1));

        let first = timer.select();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].promise().as_u64(), 1);

        let second = timer.select();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].promise().as_u64(), 2);
    }
}
