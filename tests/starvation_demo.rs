//! The starvation demonstration: a recursive tree that uses `call` at
//! every level exhausts a small pool — every domain ends up owning a
//! pending promise, nobody reaches quiescence, and no domain will ever
//! dequeue the remaining submissions. Converting the internal nodes to
//! `call_cc` (so only the leaves travel through the dispatcher) makes the
//! same tree terminate.
//!
//! One test function on purpose: the deadlocked runtime is abandoned on a
//! detached thread and stays "active" for the rest of the process, so the
//! terminating variant must run first.

mod common;

use common::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tandem::{Builder, Cx, Error};

fn tree_all_call(cx: &Cx, depth: u32) -> Result<u64, Error> {
    if depth == 0 {
        return Ok(1);
    }
    let left = cx.call(move |c| tree_all_call(c, depth - 1))?;
    let right = cx.call(move |c| tree_all_call(c, depth - 1))?;
    Ok(cx.wait(&left)?.into_result()? + cx.wait(&right)?.into_result()?)
}

fn tree_leaf_call(cx: &Cx, depth: u32) -> Result<u64, Error> {
    if depth == 0 {
        let leaf = cx.call(|_| Ok(1_u64))?;
        return cx.wait(&leaf)?.into_result();
    }
    let left = cx.call_cc(move |c| tree_leaf_call(c, depth - 1));
    let right = cx.call_cc(move |c| tree_leaf_call(c, depth - 1));
    Ok(cx.wait(&left)?.into_result()? + cx.wait(&right)?.into_result()?)
}

#[test]
fn all_call_recursion_starves_while_leaf_call_terminates() {
    init_test_logging();
    let _serial = runtime_lock();

    // Terminating variant first: internal nodes stay on their domain,
    // only the 16 leaves go through the dispatcher.
    let sum = Builder::new()
        .domains(2)
        .seed(71)
        .run(|cx| tree_leaf_call(cx, 4))
        .unwrap();
    assert_eq!(sum, 16);

    // Starving variant: with a pool of three domains, depth four cannot
    // make progress — every domain owns a pending parent and the run
    // queues drain to empty.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = Builder::new()
            .domains(2)
            .seed(71)
            .run(|cx| tree_all_call(cx, 4));
        let _ = tx.send(result);
    });
    match rx.recv_timeout(Duration::from_secs(5)) {
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // Deadlocked as designed; the runtime thread is abandoned.
        }
        Ok(result) => panic!("all-call tree unexpectedly finished: {result:?}"),
        Err(e) => panic!("runtime thread vanished: {e}"),
    }
}
