// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker's unit of execution.
//!
//! Everything a [`crate::worker::Worker`] ever runs is a `Box<dyn Work>`: a
//! self-contained step that may push more work before returning, but never
//! blocks the OS thread. Suspension points (a channel rendezvous that has no
//! partner yet, a pick waiting on a partner to commit) are modeled by simply
//! *not* pushing a continuation until the rendezvous completes, rather than
//! parking the calling stack frame.
//!
//! [`Job`] and [`Continuation`] are the two directions of that protocol: a
//! `Job<T>` is "run this, then hand the result to a continuation"; a
//! `Continuation<T>` is "resume here with a `T` (or fail here with a
//! [`Failure`])". Both are erased to `Box<dyn Work>` the moment they have
//! everything they need to run, which is what actually lands on a worker's
//! stack.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use crate::error::Failure;
use crate::worker::Worker;

/// A single runnable step.
///
/// `run` takes `self` by value (boxed) because a `Work` is consumed exactly
/// once: there is no notion of re-running or cloning a step.
pub trait Work: Send + 'static {
    fn run(self: Box<Self>, worker: &mut Worker);
}

impl fmt::Debug for dyn Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Work { .. }")
    }
}

/// Runs `work`, catching any panic and routing it through the worker's
/// handler chain instead of unwinding the worker thread.
///
/// This is the *only* place in the crate that calls [`std::panic::catch_unwind`].
/// Every suspension point re-enters the trampoline through here, so a panic
/// anywhere in a job's call graph is attributed to whichever handler was
/// installed at the time, per spec §4.3/§4.6.
pub(crate) fn run_caught(work: Box<dyn Work>, worker: &mut Worker) {
    let worker_ptr: *mut Worker = worker;
    // Safety: `worker` is reborrowed exactly once inside the closure, which
    // runs synchronously and does not outlive this call.
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let worker = unsafe { &mut *worker_ptr };
        work.run(worker);
    }));

    if let Err(payload) = result {
        fail_work(worker, Failure::new(payload));
    }
}

/// Delivers `failure` to the worker's currently installed [`Handler`], or to
/// the scheduler's `top_level_handler` if none is installed, per spec §4.6.
pub(crate) fn fail_work(worker: &mut Worker, failure: Failure) {
    if let Some(handler) = worker.handler.clone() {
        handler.handle(worker, failure);
    } else {
        worker.scheduler().report_uncaught(failure);
    }
}

/// A handler for failures raised while running a [`Work`] item.
///
/// Installed via [`crate::alt::with_handler`] (or the scheduler's
/// `top_level_handler` as the ultimate fallback), a `Handler` is how the
/// spec's "most recent enclosing handler" is modeled: it is a plain
/// `Arc<dyn Handler>` carried on [`Worker`], saved and restored by whichever
/// combinator installed it.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, worker: &mut Worker, failure: Failure);
}

impl<F> Handler for F
where
    F: Fn(&mut Worker, Failure) + Send + Sync + 'static,
{
    fn handle(&self, worker: &mut Worker, failure: Failure) {
        (self)(worker, failure)
    }
}

/// Something that can be resumed with a value, or failed with a caught panic.
///
/// A `Continuation<T>` is the receiving end of a rendezvous: a channel give,
/// a pick commit, or a job's completion all eventually resolve to calling
/// `resume` (success) or `fail` (propagated panic) on one of these.
pub trait Continuation<T>: Send + 'static {
    fn resume(self: Box<Self>, worker: &mut Worker, value: T);
    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure);
}

/// A `Work` that resumes a continuation with an already-available value.
///
/// Pushed onto a worker's stack the moment a rendezvous completes, so the
/// continuation runs on *some* worker's trampoline rather than recursing
/// into the thread that produced the value.
pub struct Resume<T> {
    cont: Box<dyn Continuation<T>>,
    value: T,
}

impl<T> Resume<T> {
    pub fn new(cont: Box<dyn Continuation<T>>, value: T) -> Self {
        Self { cont, value }
    }
}

impl<T: Send + 'static> Work for Resume<T> {
    fn run(self: Box<Self>, worker: &mut Worker) {
        self.cont.resume(worker, self.value);
    }
}

/// A `Work` that fails a continuation with a caught panic, without running
/// it through the worker's `catch_unwind` point again.
pub struct FailCont<T> {
    cont: Box<dyn Continuation<T>>,
    failure: Failure,
}

impl<T> FailCont<T> {
    pub fn new(cont: Box<dyn Continuation<T>>, failure: Failure) -> Self {
        Self { cont, failure }
    }
}

impl<T: Send + 'static> Work for FailCont<T> {
    fn run(self: Box<Self>, worker: &mut Worker) {
        self.cont.fail(worker, self.failure);
    }
}

/// A computation that produces a `T`, then hands it to a continuation.
///
/// This is the spawn-time shape: `Scheduler::spawn`/`Worker::spawn` take a
/// `Job<T>` and a continuation (by default, one that silently discards
/// successes and forwards failures to the top-level handler).
pub trait Job<T>: Send + 'static {
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>);
}

/// Lets a boxed, type-erased job be used anywhere a concrete `Job<T>` is
/// expected — the shape recursive CPS loops need, since `fn foo() -> impl
/// Job<T>` cannot name its own return type for the recursive call.
impl<T: Send + 'static> Job<T> for Box<dyn Job<T>> {
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>) {
        (*self).start(worker, k);
    }
}

/// Adapts a plain closure into a [`Job`].
///
/// The closure runs inline (on whichever worker pops the resulting `Work`);
/// any panic is caught by the trampoline's single `catch_unwind` point, not
/// by this adapter.
pub struct FnJob<F> {
    f: F,
}

impl<F> FnJob<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Job<T> for FnJob<F>
where
    T: Send + 'static,
    F: FnOnce(&mut Worker) -> T + Send + 'static,
{
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>) {
        let value = (self.f)(worker);
        k.resume(worker, value);
    }
}

/// A `Work` that starts a job with a given continuation.
///
/// This is what `spawn` actually pushes: a `Job<T>` plus a `Continuation<T>`,
/// bundled into a single trampoline step.
pub struct StartJob<T> {
    job: Box<dyn Job<T>>,
    k: Box<dyn Continuation<T>>,
}

impl<T> StartJob<T> {
    pub fn new(job: Box<dyn Job<T>>, k: Box<dyn Continuation<T>>) -> Self {
        Self { job, k }
    }
}

impl<T: Send + 'static> Work for StartJob<T> {
    fn run(self: Box<Self>, worker: &mut Worker) {
        self.job.start(worker, self.k);
    }
}

/// A continuation that discards successful results and forwards failures to
/// the scheduler's top-level handler.
///
/// Used as the default continuation for `spawn`, which (per spec §6) starts
/// a job "fire and forget": nobody is waiting on its result, but an
/// uncaught panic must still be reported rather than silently swallowed.
pub struct Detached;

impl<T: Send + 'static> Continuation<T> for Detached {
    fn resume(self: Box<Self>, _worker: &mut Worker, _value: T) {}

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        fail_work(worker, failure);
    }
}

/// Adapts a pair of closures into a [`Continuation`].
pub struct FnContinuation<R, Fa> {
    resume: R,
    fail: Fa,
}

impl<R, Fa> FnContinuation<R, Fa> {
    pub fn new(resume: R, fail: Fa) -> Self {
        Self { resume, fail }
    }
}

impl<T, R, Fa> Continuation<T> for FnContinuation<R, Fa>
where
    T: Send + 'static,
    R: FnOnce(&mut Worker, T) + Send + 'static,
    Fa: FnOnce(&mut Worker, Failure) + Send + 'static,
{
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        (self.resume)(worker, value)
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        (self.fail)(worker, failure)
    }
}

/// Re-exported for callers building custom `Job`/`Continuation` impls that
/// need to inspect a downcast-able payload without going through `Failure`.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Installs `handler` as the worker's current [`Handler`] for the duration
/// of running `job`, restoring whatever was previously installed once `job`
/// resumes or fails.
///
/// Per spec §4.6, `handler` is a per-worker pointer to "the most recent
/// continuation started" rather than something carried by the suspended
/// continuation itself: a job that suspends at a channel op and is later
/// resumed on a *different* worker sees that worker's ambient handler, not
/// the one installed here. This is a faithful reading of the spec's stated
/// model, not a shortcut — it's exactly what makes handler installation an
/// O(1) pointer swap rather than something every `Continuation` has to carry.
pub fn with_handler<T, J, H>(job: J, handler: H) -> WithHandler<J, H>
where
    T: Send + 'static,
    J: Job<T>,
    H: Handler,
{
    WithHandler { job, handler }
}

pub struct WithHandler<J, H> {
    job: J,
    handler: H,
}

impl<T, J, H> Job<T> for WithHandler<J, H>
where
    T: Send + 'static,
    J: Job<T>,
    H: Handler,
{
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>) {
        let prev = worker.handler.replace(std::sync::Arc::new(self.handler));
        Box::new(self.job).start(worker, Box::new(RestoreHandler { prev, k }));
    }
}

struct RestoreHandler<K> {
    prev: Option<std::sync::Arc<dyn Handler>>,
    k: K,
}

impl<T> Continuation<T> for RestoreHandler<Box<dyn Continuation<T>>>
where
    T: Send + 'static,
{
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        worker.handler = self.prev;
        self.k.resume(worker, value);
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        worker.handler = self.prev;
        self.k.fail(worker, failure);
    }
}

/// Sequencing combinators over [`Job`], the monadic "bind" for this crate's
/// direct-style computations.
///
/// These are what let a computation that performs a channel rendezvous
/// followed by more work be expressed without ever blocking a worker
/// thread: `then`'s continuation is only invoked once the first job's
/// result is actually available.
pub trait JobExt<T>: Job<T> + Sized
where
    T: Send + 'static,
{
    /// Runs `self`, then builds and runs a second job from its result.
    fn then<U, F, J2>(self, f: F) -> Then<Self, F>
    where
        U: Send + 'static,
        F: FnOnce(T, &mut Worker) -> J2 + Send + 'static,
        J2: Job<U>,
    {
        Then { job: self, f }
    }

    /// Transforms a successful result without introducing a new suspension
    /// point.
    fn map<U, F>(self, f: F) -> Map<Self, F>
    where
        U: Send + 'static,
        F: FnOnce(T, &mut Worker) -> U + Send + 'static,
    {
        Map { job: self, f }
    }

    /// Runs a side effect if `self` fails, forwarding the failure onward.
    fn map_err<F>(self, f: F) -> CatchJob<Self, F>
    where
        F: FnOnce(&Failure, &mut Worker) + Send + 'static,
    {
        CatchJob { job: self, f }
    }
}

impl<T: Send + 'static, J: Job<T>> JobExt<T> for J {}

/// The result of [`JobExt::then`]: run `job`, then build and run a second
/// job from its result.
pub struct Then<J, F> {
    job: J,
    f: F,
}

impl<T, U, J, F, J2> Job<U> for Then<J, F>
where
    T: Send + 'static,
    U: Send + 'static,
    J: Job<T>,
    F: FnOnce(T, &mut Worker) -> J2 + Send + 'static,
    J2: Job<U>,
{
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<U>>) {
        Box::new(self.job).start(worker, Box::new(ThenCont { f: self.f, k }));
    }
}

struct ThenCont<F, K> {
    f: F,
    k: K,
}

impl<T, U, F, J2> Continuation<T> for ThenCont<F, Box<dyn Continuation<U>>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T, &mut Worker) -> J2 + Send + 'static,
    J2: Job<U>,
{
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        let job2 = (self.f)(value, worker);
        Box::new(job2).start(worker, self.k);
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        self.k.fail(worker, failure);
    }
}

/// The result of [`JobExt::map`]: run `job`, then transform its result
/// in-place without introducing a new suspension point.
pub struct Map<J, F> {
    job: J,
    f: F,
}

impl<T, U, J, F> Job<U> for Map<J, F>
where
    T: Send + 'static,
    U: Send + 'static,
    J: Job<T>,
    F: FnOnce(T, &mut Worker) -> U + Send + 'static,
{
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<U>>) {
        Box::new(self.job).start(worker, Box::new(MapCont { f: self.f, k }));
    }
}

struct MapCont<F, K> {
    f: F,
    k: K,
}

impl<T, U, F> Continuation<T> for MapCont<F, Box<dyn Continuation<U>>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T, &mut Worker) -> U + Send + 'static,
{
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        let out = (self.f)(value, worker);
        self.k.resume(worker, out);
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        self.k.fail(worker, failure);
    }
}

/// The result of [`JobExt::map_err`]: run a side effect on failure, then
/// forward it onward unchanged.
pub struct CatchJob<J, F> {
    job: J,
    f: F,
}

impl<T, J, F> Job<T> for CatchJob<J, F>
where
    T: Send + 'static,
    J: Job<T>,
    F: FnOnce(&Failure, &mut Worker) + Send + 'static,
{
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>) {
        Box::new(self.job).start(worker, Box::new(CatchCont { f: self.f, k }));
    }
}

struct CatchCont<F, K> {
    f: F,
    k: K,
}

impl<T, F> Continuation<T> for CatchCont<F, Box<dyn Continuation<T>>>
where
    T: Send + 'static,
    F: FnOnce(&Failure, &mut Worker) + Send + 'static,
{
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        self.k.resume(worker, value);
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        (self.f)(&failure, worker);
        self.k.fail(worker, failure);
    }
}
