//! Per-domain run queue with randomized selection.
//!
//! The ready set is an unordered multiset. When several entries are ready
//! the next one is chosen uniformly at random from a runtime-seeded PRNG;
//! no FIFO or priority guarantee is exposed. Randomized tie-breaking is a
//! deliberate design decision: callers must not grow implicit priority
//! assumptions the scheduler never promised.
//!
//! Task entries (`Start`/`Resume`) are deduplicated by promise id, so a
//! task woken twice before running occupies one slot. Entries referring to
//! records that have since left `Pending` are discarded by the scheduler's
//! clean pass at pop time.

use crate::events::RunnableEntry;
use crate::types::PromiseId;
use crate::util::DetRng;
use std::collections::HashSet;

/// One ready continuation.
#[derive(Debug)]
pub(crate) enum ReadyEntry {
    /// A task promise whose closure has not yet begun.
    Start(PromiseId),
    /// A suspended fiber made runnable (awaited promise settled, yield,
    /// cancellation wake-up).
    Resume(PromiseId),
    /// A syscall resolution returned by the events source.
    Hook(RunnableEntry),
}

/// The per-domain ready multiset.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    entries: Vec<ReadyEntry>,
    /// Task ids currently queued via `Start`/`Resume` (dedup).
    scheduled: HashSet<PromiseId>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry; duplicate task entries are dropped.
    pub(crate) fn push(&mut self, entry: ReadyEntry) {
        match &entry {
            ReadyEntry::Start(id) | ReadyEntry::Resume(id) => {
                if !self.scheduled.insert(*id) {
                    return;
                }
            }
            ReadyEntry::Hook(_) => {}
        }
        self.entries.push(entry);
    }

    /// Removes and returns a uniformly random ready entry.
    pub(crate) fn pop_random(&mut self, rng: &mut DetRng) -> Option<ReadyEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.next_usize(self.entries.len());
        let entry = self.entries.swap_remove(index);
        if let ReadyEntry::Start(id) | ReadyEntry::Resume(id) = &entry {
            self.scheduled.remove(id);
        }
        Some(entry)
    }
}
