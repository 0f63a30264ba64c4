//! Runtime construction, the `run` entry point, and teardown.
//!
//! A runtime is a fixed pool of domains: the main domain (id 0), which
//! runs the caller's body as the root task, plus `workers` worker domains.
//! The pool size is fixed at `run` time; there is no dynamic growth. One
//! runtime may be active per process at a time.

use crate::domain::{run_domain, DomainHandle, Role};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Events, NoopEvents};
use crate::dispatch::Dispatcher;
use crate::ops::Cx;
use crate::registry::{CancelCell, ErasedValue, PromiseRecord, TaskClosure};
use crate::runqueue::ReadyEntry;
use crate::types::{DomainId, Outcome, PromiseId};
use crate::util::derive_stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Stream label for the dispatcher's PRNG; domain streams use their index.
const DISPATCHER_STREAM: u64 = u64::MAX;

static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        RUNTIME_ACTIVE.store(false, Ordering::Release);
    }
}

/// State shared by every domain of one runtime.
pub(crate) struct RuntimeShared {
    domains: Vec<Arc<DomainHandle>>,
    pub(crate) dispatcher: Dispatcher,
    shutdown: AtomicBool,
    thread_name_prefix: String,
}

impl RuntimeShared {
    pub(crate) fn domain(&self, id: DomainId) -> &Arc<DomainHandle> {
        &self.domains[id.index()]
    }

    pub(crate) fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn thread_name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }
}

type EventsFactory = Box<dyn Fn(DomainId) -> Arc<dyn Events>>;

/// Builder for a runtime with custom configuration.
///
/// ```no_run
/// use tandem::Builder;
///
/// let sum = Builder::new()
///     .domains(3)
///     .seed(42)
///     .run(|cx| {
///         let p = cx.call(|_| Ok(21))?;
///         let q = cx.call(|_| Ok(21))?;
///         Ok(cx.wait(&p)?.unwrap() + cx.wait(&q)?.unwrap())
///     })
///     .unwrap();
/// assert_eq!(sum, 42);
/// ```
pub struct Builder {
    workers: Option<usize>,
    seed: Option<u64>,
    thread_name_prefix: String,
    events: Option<EventsFactory>,
}

impl Builder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: None,
            seed: None,
            thread_name_prefix: "tandem".to_string(),
            events: None,
        }
    }

    /// Sets the number of *worker* domains (the main domain is always
    /// present on top of these). Default: `available_parallelism() - 1`,
    /// minimum 1. With zero workers, `call` fails with `EmptyDomainPool`.
    #[must_use]
    pub fn domains(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Seeds the runtime PRNG. All scheduling tie-breaks derive from this
    /// seed; a logged seed reproduces the same decisions. Default: OS
    /// entropy.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the worker and fiber thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Installs an events-source factory, invoked once per domain.
    /// Default: [`NoopEvents`].
    #[must_use]
    pub fn events<F>(mut self, factory: F) -> Self
    where
        F: Fn(DomainId) -> Arc<dyn Events> + 'static,
    {
        self.events = Some(Box::new(factory));
        self
    }

    /// Initializes the runtime, spawns the workers, runs `body` as the
    /// root task on the main domain, tears everything down, and returns
    /// `body`'s result.
    ///
    /// # Panics
    ///
    /// Re-raises a panic of the root task's closure.
    pub fn run<T, F>(self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Cx) -> Result<T> + Send + 'static,
    {
        if RUNTIME_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::AlreadyRunning)
                .with_context("another runtime is active in this process"));
        }
        let _guard = ActiveGuard;

        let workers = self.workers.unwrap_or_else(default_workers);
        let seed = self.seed.unwrap_or_else(entropy_seed);
        let factory: EventsFactory = self
            .events
            .unwrap_or_else(|| Box::new(|_| Arc::new(NoopEvents)));
        info!(seed, workers, "runtime starting");

        let total = workers + 1;
        let domains: Vec<Arc<DomainHandle>> = (0..total)
            .map(|index| {
                let id = DomainId(u32::try_from(index).unwrap_or(u32::MAX));
                Arc::new(DomainHandle::new(
                    id,
                    derive_stream(seed, index as u64),
                    factory(id),
                ))
            })
            .collect();
        let rt = Arc::new(RuntimeShared {
            domains,
            dispatcher: Dispatcher::new(derive_stream(seed, DISPATCHER_STREAM)),
            shutdown: AtomicBool::new(false),
            thread_name_prefix: self.thread_name_prefix,
        });

        // Enqueue the root task on the main domain.
        let root = PromiseId::next();
        let closure: TaskClosure = Box::new(move |cx| body(cx).map(|v| Box::new(v) as ErasedValue));
        let main = Arc::clone(rt.domain(DomainId(0)));
        {
            let mut core = main.core.lock();
            core.registry.insert(PromiseRecord::task(
                root,
                None,
                closure,
                Arc::new(CancelCell::new()),
            ));
            core.run_queue.push(ReadyEntry::Start(root));
        }
        debug!(promise = %root, "root task enqueued");

        let mut handles = Vec::with_capacity(workers);
        for index in 1..total {
            let worker_rt = Arc::clone(&rt);
            let dom = Arc::clone(rt.domain(DomainId(u32::try_from(index).unwrap_or(u32::MAX))));
            let spawned = thread::Builder::new()
                .name(format!("{}-domain-{index}", rt.thread_name_prefix()))
                .spawn(move || run_domain(&worker_rt, &dom, Role::Worker));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    rt.begin_shutdown();
                    for dom in &rt.domains {
                        dom.interrupt();
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::internal("failed to spawn worker domain")
                        .with_source(e));
                }
            }
        }

        run_domain(&rt, &main, Role::Main { root });

        rt.begin_shutdown();
        for dom in &rt.domains {
            dom.interrupt();
        }
        for handle in handles {
            let _ = handle.join();
        }
        info!("runtime stopped");

        let outcome = {
            let mut core = main.core.lock();
            core.registry
                .remove(root)
                .and_then(|rec| rec.state.into_outcome())
        };
        match outcome {
            Some(Outcome::Resolved(value)) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(Error::internal("root value type mismatch")),
            },
            Some(Outcome::Failed(e)) => Err(e),
            Some(Outcome::Cancelled(reason)) => Err(Error::cancelled(&reason)),
            Some(Outcome::Panicked(payload)) => {
                panic!("root task panicked: {}", payload.message())
            }
            None => Err(Error::internal("root promise vanished")),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `body` on a default-configured runtime. See [`Builder::run`].
pub fn run<T, F>(body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Cx) -> Result<T> + Send + 'static,
{
    Builder::new().run(body)
}

/// Default worker count: one per physical core, minus the main domain.
fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Seeds from OS entropy (hasher randomness mixed with the clock) when no
/// explicit seed was configured.
fn entropy_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = RandomState::new().build_hasher();
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) ^ d.as_secs())
        .unwrap_or(0);
    hasher.write_u64(clock);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, runtime_lock};

    #[test]
    fn default_workers_is_at_least_one() {
        assert!(default_workers() >= 1);
    }

    #[test]
    fn run_returns_root_value() {
        init_test_logging();
        let _serial = runtime_lock();
        let result = Builder::new().domains(1).seed(7).run(|_| Ok(41 + 1));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn run_propagates_root_error() {
        init_test_logging();
        let _serial = runtime_lock();
        let result: Result<()> = Builder::new()
            .domains(1)
            .seed(7)
            .run(|_| Err(Error::user("root failed")));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::User);
    }

    #[test]
    fn concurrent_run_is_rejected() {
        init_test_logging();
        let _serial = runtime_lock();
        let result = Builder::new().domains(1).seed(7).run(|_| {
            // A nested run from inside a task must observe the guard.
            let nested = Builder::new().domains(1).run(|_| Ok(()));
            Ok(nested.unwrap_err().kind())
        });
        assert_eq!(result.unwrap(), ErrorKind::AlreadyRunning);
    }
}
