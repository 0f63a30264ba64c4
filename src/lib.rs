//! Tandem: a composable concurrency runtime with cooperative domains.
//!
//! # Overview
//!
//! Tandem multiplexes user-defined work across a fixed pool of worker
//! threads called *domains*. Inside one domain, execution is strictly
//! cooperative: tasks interleave only at well-defined suspension points
//! (`wait`, `suspend`, `yield_now`, task return). Across domains, tasks run
//! in true parallel.
//!
//! # Core Guarantees
//!
//! - **First-class promises**: every task returns an awaitable [`Promise`];
//!   a promise resolves at most once and is consumed at most once
//! - **Structured cancellation**: cancelling a task cancels its whole
//!   subtree, across domain boundaries; a parent never finishes while a
//!   child is still pending
//! - **External events**: syscall promises are resolved by outside code
//!   through the narrow [`Events`] interface (`select` / `interrupt`)
//! - **No priority oracle**: run-queue and dispatcher tie-breaking draw
//!   from a runtime-seeded PRNG, never from submission order
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, outcomes, cancellation reasons)
//! - [`registry`]: Per-domain promise records and parent/child graph
//! - [`runqueue`]: Per-domain ready set with randomized selection
//! - [`dispatch`]: Cross-domain queue for parallel task submissions
//! - [`domain`]: Domain state and the scheduler loop
//! - [`cancel`]: The cancellation engine
//! - [`events`]: The events-source contract for external I/O and timers
//! - [`ops`]: The task context [`Cx`] carrying the public operations
//! - [`runtime`]: Builder, `run`, worker spawn and teardown
//! - [`time`]: A timer events source, the canonical events consumer
//! - [`sync`]: Cooperative synchronization helpers
//! - [`util`]: Deterministic PRNG
//! - [`error`]: Error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod events;
pub mod ops;
pub mod registry;
pub mod runqueue;
pub mod runtime;
pub mod sync;
pub mod time;
pub mod types;
pub mod util;

mod fiber;

#[cfg(test)]
mod test_utils;

// Re-exports for convenient access to core types
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use events::{Events, NoopEvents, RunnableEntry};
pub use ops::{Cx, Promise};
pub use runtime::{run, Builder};
pub use types::{CancelKind, CancelReason, DomainId, Outcome, PanicPayload, PromiseId};
