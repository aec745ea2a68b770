// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Selective choice over alternatives.
//!
//! An [`Alternative<T>`] is anything that can participate in a [`choose`]: a
//! channel give/take (see [`crate::channel`]), a timeout ([`after`]), an
//! already-decided value ([`always`]), or a combinator built from another
//! alternative ([`wrap`], [`guard`], [`with_nack`]). `choose` runs every
//! alternative under one shared [`Pick`], and exactly one of them ever ends
//! up calling its continuation — the rest are left queued on whatever
//! structure they suspended on, where they are skipped lazily the next time
//! something scans past them.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Failure;
use crate::pick::Pick;
use crate::work::{Continuation, Job};
use crate::worker::Worker;

/// One participant in a [`choose`].
///
/// Implementors attempt to synchronize immediately; if no partner is ready,
/// they enqueue themselves wherever is appropriate (a channel's waiter
/// list, a timer wheel, nowhere at all) and return. Exactly one alternative
/// in a given `choose` ever calls `k`.
pub trait Alternative<T>: Send + 'static {
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>);
}

struct SyncJob<T> {
    alts: Vec<Box<dyn Alternative<T>>>,
}

impl<T: Send + 'static> Job<T> for SyncJob<T> {
    #[tracing::instrument(level = "trace", name = "pick", skip_all, fields(branches = self.alts.len()))]
    fn start(self: Box<Self>, worker: &mut Worker, k: Box<dyn Continuation<T>>) {
        let pick = Pick::new();
        let shared = Arc::new(spin::Mutex::new(Some(k)));
        let claimed = Arc::new(AtomicBool::new(false));

        for (id, alt) in self.alts.into_iter().enumerate() {
            if pick.is_committed() {
                break;
            }
            let shim = Box::new(Shim {
                shared: shared.clone(),
                claimed: claimed.clone(),
            });
            alt.sync(worker, &pick, id, shim);
        }
    }
}

struct Shim<T> {
    shared: Arc<spin::Mutex<Option<Box<dyn Continuation<T>>>>>,
    claimed: Arc<AtomicBool>,
}

impl<T: Send + 'static> Continuation<T> for Shim<T> {
    fn resume(self: Box<Self>, worker: &mut Worker, value: T) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(k) = self.shared.lock().take() {
            k.resume(worker, value);
        }
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(k) = self.shared.lock().take() {
            k.fail(worker, failure);
        }
    }
}

/// Turns a single [`Alternative`] into a [`Job`].
pub fn sync<T: Send + 'static>(alt: impl Alternative<T>) -> impl Job<T> {
    SyncJob {
        alts: vec![Box::new(alt)],
    }
}

/// Offers every alternative in `alts` for selection, committing to whichever
/// finds a partner (or becomes ready) first.
pub fn choose<T: Send + 'static>(alts: impl IntoAlternatives<T>) -> impl Job<T> {
    SyncJob {
        alts: alts.into_alternatives(),
    }
}

/// Converts a tuple of [`Alternative`]s into the list [`choose`] scans.
pub trait IntoAlternatives<T> {
    fn into_alternatives(self) -> Vec<Box<dyn Alternative<T>>>;
}

impl<T: Send + 'static> IntoAlternatives<T> for Vec<Box<dyn Alternative<T>>> {
    fn into_alternatives(self) -> Vec<Box<dyn Alternative<T>>> {
        self
    }
}

macro_rules! impl_into_alternatives_for_tuple {
    ($($name:ident),+) => {
        impl<T: Send + 'static, $($name: Alternative<T>),+> IntoAlternatives<T> for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_alternatives(self) -> Vec<Box<dyn Alternative<T>>> {
                let ($($name,)+) = self;
                vec![$(Box::new($name) as Box<dyn Alternative<T>>),+]
            }
        }
    };
}

impl_into_alternatives_for_tuple!(A, B);
impl_into_alternatives_for_tuple!(A, B, C);
impl_into_alternatives_for_tuple!(A, B, C, D);
impl_into_alternatives_for_tuple!(A, B, C, D, E);

/// An alternative that is always immediately ready with `value`.
///
/// Useful as a `choose` branch representing "or just use this default",
/// and as the building block `guard`/`wrap` compose with.
pub struct Always<T>(T);

#[must_use]
pub fn always<T: Send + 'static>(value: T) -> Always<T> {
    Always(value)
}

impl<T: Send + 'static> Alternative<T> for Always<T> {
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        if pick.try_commit_alone() {
            pick.fire_nacks(id, worker);
            worker.resume_tail(k, self.0);
        }
    }
}

/// An alternative that is never ready.
///
/// Combined with [`after`] inside a `choose`, this is how a "wait up to a
/// deadline, otherwise give up forever" pattern is expressed.
pub struct Never;

#[must_use]
pub fn never<T: Send + 'static>() -> Never {
    Never
}

impl<T: Send + 'static> Alternative<T> for Never {
    fn sync(self: Box<Self>, _worker: &mut Worker, _pick: &Arc<Pick>, _id: usize, _k: Box<dyn Continuation<T>>) {}
}

/// An alternative that becomes ready after `duration` elapses.
pub struct After(Duration);

#[must_use]
pub fn after(duration: Duration) -> After {
    After(duration)
}

impl Alternative<()> for After {
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<()>>) {
        let pick = pick.clone();
        worker.scheduler().timer().schedule(self.0, move |worker| {
            if pick.try_commit_alone() {
                pick.fire_nacks(id, worker);
                worker.resume_tail(k, ());
            }
        });
    }
}

/// Transforms a successful rendezvous' value.
pub struct Wrap<A, F> {
    alt: A,
    f: F,
}

pub fn wrap<T, U, A, F>(alt: A, f: F) -> Wrap<A, F>
where
    T: Send + 'static,
    U: Send + 'static,
    A: Alternative<T>,
    F: FnOnce(T, &mut Worker) -> U + Send + 'static,
{
    Wrap { alt, f }
}

impl<T, U, A, F> Alternative<U> for Wrap<A, F>
where
    T: Send + 'static,
    U: Send + 'static,
    A: Alternative<T>,
    F: FnOnce(T, &mut Worker) -> U + Send + 'static,
{
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<U>>) {
        Box::new(self.alt).sync(worker, pick, id, Box::new(WrapCont { f: self.f, k }));
    }
}

struct WrapCont<F, K> {
    f: F,
    k: K,
}

impl<T, U, F> Continuation<T> for WrapCont<F, Box<dyn Continuation<U>>>
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

/// Starts `abort` if this branch is not the one the enclosing `choose`
/// commits to.
///
/// `abort` is the negative acknowledgement itself: it is spawned as its own
/// detached job on the scheduler once the pick resolves elsewhere, never run
/// inline on whichever worker is settling the rendezvous. Per spec §4.5, its
/// failures are not this branch's business — they go to the top-level
/// handler, same as any other `spawn`ed job's would.
pub struct WrapAbort<A, J> {
    alt: A,
    abort: J,
}

pub fn wrap_abort<T, A, J>(alt: A, abort: J) -> WrapAbort<A, J>
where
    T: Send + 'static,
    A: Alternative<T>,
    J: Job<()>,
{
    WrapAbort { alt, abort }
}

impl<T, A, J> Alternative<T> for WrapAbort<A, J>
where
    T: Send + 'static,
    A: Alternative<T>,
    J: Job<()>,
{
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        let abort = self.abort;
        pick.register_nack(id, move |worker: &mut Worker| {
            let _ = worker.scheduler().spawn(abort);
        });
        Box::new(self.alt).sync(worker, pick, id, k);
    }
}

/// Defers building the real alternative until the moment this branch is
/// offered for synchronization, by running `job` and synchronizing on
/// whatever alternative it produces.
///
/// Unlike a plain closure, `job` may itself suspend (a channel take, another
/// `choose`) before handing back the alternative to offer — this is how a
/// `choose` branch can, say, read a piece of shared state through its own
/// rendezvous before deciding what to synchronize on, exactly once, and only
/// for branches actually reached.
pub struct Guard<J, A> {
    job: J,
    // `A` (the alternative `job` produces) only otherwise appears in the
    // `J: Job<A>` bound below, which isn't enough to constrain it in the
    // `impl Alternative<T> for Guard<J, A>` block; this marker pins it to
    // `Self` so the compiler can see it.
    _produces: PhantomData<fn() -> A>,
}

pub fn guard<T, A, J>(job: J) -> Guard<J, A>
where
    T: Send + 'static,
    A: Alternative<T>,
    J: Job<A>,
{
    Guard {
        job,
        _produces: PhantomData,
    }
}

impl<T, A, J> Alternative<T> for Guard<J, A>
where
    T: Send + 'static,
    A: Alternative<T>,
    J: Job<A>,
{
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        let pick = pick.clone();
        Box::new(self.job).start(worker, Box::new(GuardCont { pick, id, k }));
    }
}

struct GuardCont<K> {
    pick: Arc<Pick>,
    id: usize,
    k: K,
}

impl<T, A> Continuation<A> for GuardCont<Box<dyn Continuation<T>>>
where
    T: Send + 'static,
    A: Alternative<T>,
{
    fn resume(self: Box<Self>, worker: &mut Worker, alt: A) {
        Box::new(alt).sync(worker, &self.pick, self.id, self.k);
    }

    fn fail(self: Box<Self>, worker: &mut Worker, failure: Failure) {
        self.k.fail(worker, failure);
    }
}

/// The one-shot alternative a [`with_nack`] builder is handed.
///
/// `Nack` becomes synchronizable exactly once the `choose` that produced it
/// commits to some other branch, and never otherwise: a job that `sync`s on
/// it (possibly inside a further `choose` of its own) is only ever resumed
/// after that happens. Cloning is not provided — a nack fires once, for the
/// one job that ends up waiting on it.
pub struct Nack {
    cell: Arc<NackCell>,
}

impl Alternative<()> for Nack {
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<()>>) {
        self.cell.sync(worker, pick, id, k);
    }
}

struct NackWaiter {
    pick: Arc<Pick>,
    id: usize,
    k: Box<dyn Continuation<()>>,
}

/// Backing state for a [`Nack`]: fired at most once, by the pick that
/// produced it; synchronized on at most once, by whatever job the
/// `with_nack` builder handed it to.
struct NackCell {
    fired: AtomicBool,
    waiter: spin::Mutex<Option<NackWaiter>>,
}

impl NackCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            waiter: spin::Mutex::new(None),
        })
    }

    fn sync(self: &Arc<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<()>>) {
        let mut waiter = self.waiter.lock();
        if self.fired.load(Ordering::Acquire) {
            drop(waiter);
            if pick.try_commit_alone() {
                pick.fire_nacks(id, worker);
                worker.resume_tail(k, ());
            }
            return;
        }
        *waiter = Some(NackWaiter {
            pick: pick.clone(),
            id,
            k,
        });
    }

    fn fire(self: &Arc<Self>, worker: &mut Worker) {
        self.fired.store(true, Ordering::Release);
        let waiter = self.waiter.lock().take();
        if let Some(NackWaiter { pick, id, k }) = waiter {
            if pick.try_commit_alone() {
                pick.fire_nacks(id, worker);
                worker.resume_tail(k, ());
            }
        }
    }
}

/// Calls `build(nack)` to get the alternative to offer, where `nack` becomes
/// available iff the enclosing `choose` commits to a different branch.
///
/// This is the mechanism a selective-choice branch uses to release a
/// resource it tentatively claimed (e.g. un-registering interest in an
/// external event) when a sibling branch wins instead, by handing a job of
/// its own a real alternative to synchronize on rather than a fire-and-forget
/// callback. [`wrap_abort`] covers the common case of simply spawning a job
/// when a branch loses, without needing the nack alternative itself.
pub struct WithNack<F, A> {
    build: F,
    // Same reasoning as `Guard::_produces`: `A` only appears in `F`'s bound
    // below otherwise.
    _produces: PhantomData<fn() -> A>,
}

pub fn with_nack<T, A, F>(build: F) -> WithNack<F, A>
where
    T: Send + 'static,
    A: Alternative<T>,
    F: FnOnce(Nack) -> A + Send + 'static,
{
    WithNack {
        build,
        _produces: PhantomData,
    }
}

impl<T, A, F> Alternative<T> for WithNack<F, A>
where
    T: Send + 'static,
    A: Alternative<T>,
    F: FnOnce(Nack) -> A + Send + 'static,
{
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        let cell = NackCell::new();
        let fire_cell = cell.clone();
        pick.register_nack(id, move |worker: &mut Worker| fire_cell.fire(worker));
        let alt = (self.build)(Nack { cell });
        Box::new(alt).sync(worker, pick, id, k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::work::FnJob;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn always_completes_immediately() {
        let scheduler = Scheduler::builder().worker_count(1).build();
        let got = Arc::new(AtomicU32::new(0));
        let got2 = got.clone();
        scheduler.spawn(sync(always(5u32)).map(move |v, _w| {
            got2.store(v, Ordering::SeqCst);
        }));
        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(got.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn after_fires_once_duration_elapses() {
        let scheduler = Scheduler::builder().worker_count(1).build();
        let got = Arc::new(AtomicU32::new(0));
        let got2 = got.clone();
        scheduler.spawn(sync(after(Duration::from_millis(5))).map(move |(), _w| {
            got2.store(1, Ordering::SeqCst);
        }));
        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrap_abort_runs_only_on_the_losing_branch() {
        let scheduler = Scheduler::builder().worker_count(1).build();
        let aborted = Arc::new(AtomicU32::new(0));
        let aborted2 = aborted.clone();

        let losing = wrap_abort(
            never::<u32>(),
            FnJob::new(move |_w| {
                aborted2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.spawn(choose((losing, always(5u32))).map(|_, _w| ()));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_runs_its_job_once_and_syncs_the_result() {
        let scheduler = Scheduler::builder().worker_count(1).build();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let got = Arc::new(AtomicU32::new(0));
        let got2 = got.clone();

        let guarded = guard(FnJob::new(move |_w| {
            ran2.fetch_add(1, Ordering::SeqCst);
            always(9u32)
        }));
        scheduler.spawn(sync(guarded).map(move |v, _w| {
            got2.store(v, Ordering::SeqCst);
        }));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(got.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn with_nack_alt_becomes_available_only_when_losing() {
        let scheduler = Scheduler::builder().worker_count(2).build();
        let sched2 = scheduler.clone();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();

        let losing = with_nack(move |nack: Nack| {
            let fired3 = fired2.clone();
            let _ = sched2.spawn(sync(nack).map(move |(), _w| {
                fired3.fetch_add(1, Ordering::SeqCst);
            }));
            never::<u32>()
        });
        scheduler.spawn(choose((losing, always(5u32))).map(|_, _w| ()));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
