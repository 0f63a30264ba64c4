//! Promise lifecycle invariants: single resolution, single consumption,
//! foreign-domain rejection, empty-await preconditions, and the
//! cross-domain exclusion of parallel calls.

mod common;

use common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem::{Builder, DomainId, Error, ErrorKind};

#[test]
fn outcome_is_consumed_exactly_once() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let p = cx.call_cc(|_| Ok(5));
            let outcome = cx.wait(&p)?;
            assert_eq!(outcome.unwrap(), 5);

            // Second await of the same promise is an error, never a value.
            let second = cx.wait(&p);
            assert_eq!(second.unwrap_err().kind(), ErrorKind::AlreadyConsumed);
            assert!(!cx.is_pending(&p)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn uid_is_stable_and_pending_tracks_state() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let p = cx.call_cc(|_| Ok(1));
            let id = cx.uid(&p);
            assert!(cx.is_pending(&p)?);
            let _ = cx.wait(&p)?;
            assert_eq!(cx.uid(&p), id);
            assert!(!cx.is_pending(&p)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn empty_await_is_rejected() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let none: Vec<tandem::Promise<i32>> = Vec::new();
            assert_eq!(
                cx.wait_all(&none).unwrap_err().kind(),
                ErrorKind::EmptyAwait
            );
            assert_eq!(
                cx.wait_first(&none).unwrap_err().kind(),
                ErrorKind::EmptyAwait
            );
            Ok(())
        })
        .unwrap();
}

#[test]
fn call_without_workers_reports_empty_pool() {
    init_test_logging();
    let _serial = runtime_lock();
    let kind = Builder::new()
        .domains(0)
        .seed(11)
        .run(|cx| match cx.call(|_| Ok(0)) {
            Err(e) => Ok(e.kind()),
            Ok(_) => Ok(ErrorKind::Internal),
        })
        .unwrap();
    assert_eq!(kind, ErrorKind::EmptyDomainPool);
}

#[test]
fn call_never_runs_on_the_callers_domain() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(3)
        .seed(11)
        .run(|cx| {
            let here = cx.domain();
            let mut ps = Vec::new();
            for _ in 0..8 {
                ps.push(cx.call(move |worker| Ok(worker.domain()))?);
            }
            for outcome in cx.wait_all(&ps)? {
                let ran_on: DomainId = outcome.unwrap();
                assert_ne!(ran_on, here);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn parallel_results_arrive_in_input_order() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(3)
        .seed(17)
        .run(|cx| {
            let ps: Vec<_> = (0..12_i64)
                .map(|i| cx.call(move |_| Ok(i * i)))
                .collect::<Result<_, Error>>()?;
            let values: Vec<i64> = cx
                .wait_all(&ps)?
                .into_iter()
                .map(tandem::Outcome::unwrap)
                .collect();
            let expected: Vec<i64> = (0..12).map(|i| i * i).collect();
            assert_eq!(values, expected);
            Ok(())
        })
        .unwrap();
}

#[test]
fn failed_closure_becomes_failed_outcome() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let p = cx.call_cc::<i32, _>(|_| Err(Error::user("task refused")));
            let outcome = cx.wait(&p)?;
            assert!(outcome.is_failed());
            // The failure reaches the parent only through this await.
            assert_eq!(outcome.into_result().unwrap_err().kind(), ErrorKind::User);
            Ok(())
        })
        .unwrap();
}

#[test]
fn panicking_closure_becomes_panicked_outcome() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let p = cx.call_cc::<i32, _>(|_| panic!("philosopher dropped the fork"));
            let outcome = cx.wait(&p)?;
            assert!(outcome.is_panicked());
            let err = outcome.into_result().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Panic);
            assert!(err.to_string().contains("philosopher dropped the fork"));
            Ok(())
        })
        .unwrap();
}

#[test]
fn foreign_domain_await_is_rejected() {
    init_test_logging();
    let _serial = runtime_lock();
    Builder::new()
        .domains(1)
        .seed(11)
        .run(|cx| {
            let p = cx.call_cc(|_| Ok(1));
            let foreign = p.clone();
            let probe = cx.call(move |worker| match worker.wait(&foreign) {
                Err(e) => Ok(e.kind()),
                Ok(_) => Ok(ErrorKind::Internal),
            })?;
            assert_eq!(cx.wait(&probe)?.unwrap(), ErrorKind::ForeignPromise);
            // The handle still works from its home domain.
            assert_eq!(cx.wait(&p)?.unwrap(), 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn syscall_promise_resolves_through_the_events_entry() {
    init_test_logging();
    let _serial = runtime_lock();
    let fired = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&fired);
    timer_builder(0, 23)
        .run(move |cx| {
            let p = cx.make(move || {
                observed.store(true, Ordering::SeqCst);
                Ok(7)
            });
            let entry = cx.task(&p, || ())?;
            let timer = cx
                .events()
                .as_any()
                .downcast_ref::<tandem::time::TimerEvents>()
                .expect("timer installed");
            timer.register(std::time::Instant::now(), entry);
            let outcome = cx.suspend(&p)?;
            assert_eq!(outcome.unwrap(), 7);
            Ok(())
        })
        .unwrap();
    assert!(fired.load(Ordering::SeqCst), "on_resolve ran on resolution");
}
