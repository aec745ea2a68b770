// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking entry point for code running outside the scheduler's own
//! worker threads.
//!
//! Matches the teacher's `Worker::block_on`, but where the teacher polls a
//! `Future` on the calling thread's own worker loop, this crate's jobs are
//! direct-style: there is no single stack frame to re-poll, so `run` instead
//! spins up a dedicated one-worker [`Scheduler`](crate::Scheduler), spawns
//! `job` on it, and blocks the calling thread on a condvar until the job's
//! continuation reports a result. Per spec §6, this is meant for callers
//! that are not already running inside a worker (tests, `main`, FFI
//! boundaries) — code already running on a worker should just use `then`/
//! `map`/continuation-passing instead of nesting another `run`.

use std::panic::resume_unwind;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Failure;
use crate::scheduler::Scheduler;
use crate::work::{Continuation, Handler, Job, with_handler};
use crate::worker::Worker;

enum Outcome<T> {
    Resumed(T),
    Failed(Failure),
}

struct Rendezvous<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
}

impl<T> Rendezvous<T> {
    fn settle(&self, outcome: Outcome<T>) {
        let mut guard = self.outcome.lock().unwrap();
        if guard.is_none() {
            *guard = Some(outcome);
            self.ready.notify_one();
        }
    }
}

/// The job's own continuation: handles the ordinary completion path, plus
/// any explicit [`Continuation::fail`] (e.g. a give on a closed channel).
struct Report<T>(Arc<Rendezvous<T>>);

impl<T: Send + 'static> Continuation<T> for Report<T> {
    fn resume(self: Box<Self>, _worker: &mut Worker, value: T) {
        self.0.settle(Outcome::Resumed(value));
    }

    fn fail(self: Box<Self>, _worker: &mut Worker, failure: Failure) {
        self.0.settle(Outcome::Failed(failure));
    }
}

/// The job's installed [`Handler`]: catches a panic unwound from `job`
/// itself. A panic never reaches [`Report::fail`] — per spec §4.3/§4.6, the
/// worker's single `catch_unwind` point routes it through whichever
/// `Handler` was installed around the job, not through the job's own
/// completion continuation.
struct ReportFailure<T>(Arc<Rendezvous<T>>);

impl<T: Send + 'static> Handler for ReportFailure<T> {
    fn handle(&self, _worker: &mut Worker, failure: Failure) {
        self.0.settle(Outcome::Failed(failure));
    }
}

/// Runs `job` to completion, blocking the calling OS thread until it
/// resumes or fails.
///
/// # Panics
///
/// Re-panics with the job's original payload if `job` fails uncaught (i.e.
/// no [`crate::work::with_handler`] installed around it catches the
/// failure first).
pub fn run<T, J>(job: J) -> T
where
    T: Send + 'static,
    J: Job<T>,
{
    let rendezvous = Arc::new(Rendezvous {
        outcome: Mutex::new(None),
        ready: Condvar::new(),
    });

    let scheduler = Scheduler::builder().worker_count(1).build();
    let job = with_handler(job, ReportFailure(rendezvous.clone()));
    let k: Box<dyn Continuation<T>> = Box::new(Report(rendezvous.clone()));
    scheduler
        .spawn_with(job, k)
        .expect("a freshly built scheduler never refuses a spawn");

    let mut guard = rendezvous.outcome.lock().unwrap();
    while guard.is_none() {
        guard = rendezvous.ready.wait(guard).unwrap();
    }
    let outcome = guard.take().unwrap();
    drop(guard);

    scheduler.shutdown_on_idle();
    scheduler.join();

    match outcome {
        Outcome::Resumed(value) => value,
        Outcome::Failed(failure) => resume_unwind(failure.into_payload()),
    }
}
