// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide coordinator: [`Scheduler`].
//!
//! A `Scheduler` owns the shared overflow stack workers steal from, the
//! parking lot they sleep on when there's nothing to do, the optional
//! [`Timer`] backing `after(Δ)`, and the handler that catches whatever no
//! `Work` item's own handler chain caught. It does not run jobs itself —
//! that's [`crate::worker::Worker`]'s job, one per spawned OS thread — it
//! just gives workers somewhere to hand off and pick up work.
//!
//! Grounded on the teacher's `executor.rs::Executor<P>`, minus the
//! `Future`-polling-specific pieces (`CpuLocal<Scheduler>` per-core slot,
//! join handles, task builder) that don't apply to this crate's direct-style
//! jobs.

pub(crate) mod steal;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::{Failure, SpawnError};
use crate::mcs_lock::{McsLock, McsNode};
use crate::park::{Parker, ThreadPark, UnparkToken};
use crate::time::Timer;
use crate::work::{Detached, Job, StartJob, Work};
use crate::worker::Worker;

/// State shared by every worker, behind one [`McsLock`].
///
/// `parked` lives alongside `work_stack` under the *same* lock rather than
/// in a separately-locked pool: publishing work and waking a parked worker
/// must happen as one atomic step from the publisher's point of view, and a
/// worker about to park must register its token and recheck `work_stack`
/// as one atomic step from its own point of view. Two locks here would
/// reopen exactly the gap between "nothing to do" and "nobody to wake" that
/// this structure exists to close — see spec §4.2/§8's "no lost wakeup".
pub(crate) struct Shared {
    pub(crate) work_stack: Vec<Box<dyn Work>>,
    parked: Vec<UnparkToken<ThreadPark>>,
}

/// A job that decides how long a worker should sleep when there is no work
/// left anywhere, expressed in milliseconds: `0` means "poll again
/// immediately", a negative value means "sleep until woken", anything else
/// is a real timeout.
///
/// Kept as a plain closure (rather than routed through the `Job`/
/// `Continuation` machinery every other suspension point uses) because it
/// always runs synchronously to completion on the worker that's about to
/// park — there's no rendezvous to suspend on.
pub type IdleHandler = Box<dyn Fn(&mut Worker) -> i64 + Send + Sync>;

/// The scheduler's fallback for failures with no installed
/// [`crate::work::Handler`]. Defaults to logging via `tracing`.
pub type TopLevelHandler = Box<dyn Fn(&Failure) + Send + Sync>;

pub(crate) struct Inner {
    pub(crate) state: McsLock<Shared>,
    pub(crate) timer: Timer,
    pub(crate) idle_handler: Option<IdleHandler>,
    pub(crate) top_level_handler: TopLevelHandler,
    pub(crate) stopping: AtomicBool,
    worker_count: usize,
    trampoline_depth: usize,
    next_worker_id: std::sync::atomic::AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The worker scheduler: owns the shared work stack, the worker registry
/// (as a set of OS threads), and process-wide configuration.
///
/// Cloning a `Scheduler` shares the same underlying state; this is how a
/// [`crate::worker::Worker`] running on one of its threads holds a handle
/// back to it.
#[derive(Clone)]
pub struct Scheduler {
    inner: std::sync::Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.inner.worker_count)
            .field("stopping", &self.inner.stopping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Enqueues `job` on the shared stack, waking a parked worker if one is
    /// available to run it. Failures the job doesn't catch itself are
    /// forwarded to the top-level handler, matching spec §6's "fire and
    /// forget" `spawn` semantics.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Closed`] if [`Scheduler::shutdown_on_idle`] has
    /// already been called.
    pub fn spawn<T, J>(&self, job: J) -> Result<(), SpawnError>
    where
        T: Send + 'static,
        J: Job<T>,
    {
        self.spawn_with(job, Box::new(Detached))
    }

    /// Like [`spawn`](Self::spawn), but hands the job's result (or failure)
    /// to `k` instead of discarding it. Used by [`crate::run`] to observe a
    /// job's outcome from outside the scheduler's own worker threads.
    pub(crate) fn spawn_with<T, J>(&self, job: J, k: Box<dyn crate::work::Continuation<T>>) -> Result<(), SpawnError>
    where
        T: Send + 'static,
        J: Job<T>,
    {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(SpawnError::Closed);
        }

        let work: Box<dyn Work> = Box::new(StartJob::new(Box::new(job), k));
        self.push_shared(work);
        Ok(())
    }

    pub(crate) fn push_shared(&self, work: Box<dyn Work>) {
        let mut node = McsNode::new();
        let mut guard = self.inner.state.lock(&mut node);
        guard.work_stack.push(work);
        let depth = guard.work_stack.len();
        let woken = guard.parked.pop();
        drop(guard);
        tracing::trace!(depth, "pushed work onto the shared stack");
        if let Some(token) = woken {
            token.unpark();
        }
    }

    #[must_use]
    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    /// Delivers `failure` to the top-level handler. Called when a `Work`
    /// item fails with no [`crate::work::Handler`] installed.
    pub(crate) fn report_uncaught(&self, failure: Failure) {
        (self.inner.top_level_handler)(&failure);
    }

    pub(crate) fn state_lock<'a>(&'a self, node: &'a mut McsNode) -> crate::mcs_lock::McsGuard<'a, Shared> {
        self.inner.state.lock(node)
    }

    /// Wakes one parked worker, if any are parked, under the same lock that
    /// guards `work_stack`.
    pub(crate) fn wake_one(&self) {
        let mut node = McsNode::new();
        let mut guard = self.inner.state.lock(&mut node);
        let woken = guard.parked.pop();
        drop(guard);
        if let Some(token) = woken {
            token.unpark();
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Registers `parker`'s token and rechecks `work_stack` as one critical
    /// section; parks outside the lock only if that recheck still found
    /// nothing. Returns immediately, without parking, if it found work after
    /// all — the caller is expected to go look at `work_stack` itself.
    ///
    /// Per spec §4.2/§8: a worker must never be able to observe "the shared
    /// stack is empty" and then park *without* a publisher being able to see
    /// its token, or a push-then-signal landing between the two could be
    /// lost forever. Folding both checks under [`Self::state_lock`] is what
    /// makes that impossible.
    pub(crate) fn park_if_still_empty(&self, node: &mut McsNode, parker: &Parker<ThreadPark>, timeout: Option<std::time::Duration>) {
        {
            let mut guard = self.state_lock(node);
            if !guard.work_stack.is_empty() {
                return;
            }
            guard.parked.push(parker.clone().into_unpark());
        }

        match timeout {
            Some(d) => parker.park_timeout(d),
            None => parker.park(),
        }

        // Remove our own token if we woke via timeout or a spurious wake
        // rather than having been popped by a publisher already.
        let mut guard = self.state_lock(node);
        if let Some(pos) = guard.parked.iter().position(|t| t.is(parker)) {
            guard.parked.swap_remove(pos);
        }
    }

    /// Runs the configured idle handler (if any) to decide how long an idle
    /// worker should sleep, in milliseconds, per spec §4.1 step 4's contract
    /// (`0` = poll again, negative = sleep until woken, else a real timeout).
    pub(crate) fn idle_handler_timeout(&self, worker: &mut Worker) -> Option<i64> {
        self.inner.idle_handler.as_ref().map(|f| f(worker))
    }

    /// The per-worker trampoline recursion budget, per spec §12's
    /// `stack_trampoline_depth` configuration knob.
    pub(crate) fn trampoline_depth(&self) -> usize {
        self.inner.trampoline_depth
    }

    /// Marks the scheduler as winding down: once every worker observes its
    /// own local stack, the shared stack, and the timer all empty, it exits.
    /// Already-running jobs run to completion; `spawn` after this point
    /// returns `Err`.
    pub fn shutdown_on_idle(&self) {
        tracing::debug!("scheduler marked for shutdown once idle");
        self.inner.stopping.store(true, Ordering::Release);

        let mut node = McsNode::new();
        let mut guard = self.inner.state.lock(&mut node);
        let woken = std::mem::take(&mut guard.parked);
        drop(guard);
        for token in woken {
            token.unpark();
        }
    }

    /// Blocks until every worker thread has exited.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread itself panicked (which should not happen:
    /// every `Work` item's panics are caught and routed through the handler
    /// chain instead of unwinding the worker).
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        for thread in threads {
            thread.join().expect("worker thread panicked");
        }
    }

    /// Runs one worker's trampoline loop on the calling thread, blocking
    /// until the scheduler shuts down and this worker finds nothing left to
    /// do. Per spec §12: pairs with
    /// [`SchedulerBuilder::build_without_workers`] for embedders that want
    /// to drive the scheduler's worker loops on a thread pool they already
    /// own, rather than the OS threads [`SchedulerBuilder::build`] spawns
    /// itself.
    pub fn run_worker(&self) {
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let _span = tracing::debug_span!("worker", id).entered();
        Worker::new(self.clone(), id).run();
    }
}

/// Builds a [`Scheduler`], spawning its worker threads on [`build`](Self::build)
/// or leaving that to the caller via
/// [`build_without_workers`](Self::build_without_workers).
pub struct SchedulerBuilder {
    worker_count: usize,
    idle_handler: Option<IdleHandler>,
    top_level_handler: Option<TopLevelHandler>,
    trampoline_depth: usize,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            idle_handler: None,
            top_level_handler: None,
            trampoline_depth: crate::worker::DEFAULT_TRAMPOLINE_DEPTH,
        }
    }
}

impl SchedulerBuilder {
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        assert!(worker_count > 0, "a scheduler needs at least one worker");
        self.worker_count = worker_count;
        self
    }

    #[must_use]
    pub fn idle_handler<F>(mut self, idle_handler: F) -> Self
    where
        F: Fn(&mut Worker) -> i64 + Send + Sync + 'static,
    {
        self.idle_handler = Some(Box::new(idle_handler));
        self
    }

    #[must_use]
    pub fn top_level_handler<F>(mut self, top_level_handler: F) -> Self
    where
        F: Fn(&Failure) + Send + Sync + 'static,
    {
        self.top_level_handler = Some(Box::new(top_level_handler));
        self
    }

    /// How many tail-resumptions a worker will invoke directly before
    /// falling back to push-and-return. Per spec §12's
    /// `stack_trampoline_depth`: defaults to a constant tuned for typical
    /// native stack sizes; raise it for jobs with very short per-frame
    /// stack usage, lower it if workers run with a reduced stack size.
    #[must_use]
    pub fn trampoline_depth(mut self, trampoline_depth: usize) -> Self {
        assert!(trampoline_depth > 0, "a trampoline needs at least one frame of headroom");
        self.trampoline_depth = trampoline_depth;
        self
    }

    /// Builds a [`Scheduler`] without spawning any OS threads for it, per
    /// spec §12's embedder knob: the caller is responsible for calling
    /// [`Scheduler::run_worker`] once per thread of its own pool (typically
    /// `worker_count` times). Used by tests that want to drive worker loops
    /// on threads they already control.
    #[must_use]
    pub fn build_without_workers(self) -> Scheduler {
        self.build_inner()
    }

    fn build_inner(self) -> Scheduler {
        let worker_count = self.worker_count;
        let top_level_handler = self.top_level_handler.unwrap_or_else(|| {
            Box::new(|failure: &Failure| {
                tracing::error!(%failure, "uncaught failure reached the top-level handler");
            })
        });

        let inner = Inner {
            state: McsLock::new(Shared {
                work_stack: Vec::new(),
                parked: Vec::with_capacity(worker_count),
            }),
            timer: Timer::new(),
            idle_handler: self.idle_handler,
            top_level_handler,
            stopping: AtomicBool::new(false),
            worker_count,
            trampoline_depth: self.trampoline_depth,
            next_worker_id: std::sync::atomic::AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        };
        Scheduler {
            inner: std::sync::Arc::new(inner),
        }
    }

    #[must_use]
    pub fn build(self) -> Scheduler {
        let worker_count = self.worker_count;
        let scheduler = self.build_inner();

        let mut threads = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let scheduler = scheduler.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    let _span = tracing::debug_span!("worker", id).entered();
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        Worker::new(scheduler, id).run();
                    }));
                    if result.is_err() {
                        tracing::error!(id, "worker thread panicked outside of a Work item");
                    }
                })
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        *scheduler.inner.threads.lock().unwrap() = threads;

        scheduler
    }
}
