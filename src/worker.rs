// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-OS-thread trampoline loop: [`Worker`].
//!
//! Grounded on the teacher's `executor.rs::Worker<P>::run`/`tick`/
//! `try_steal`, reworked around a `Vec<Box<dyn Work>>` local stack instead
//! of a `Future`-polling run queue, and a suffix-steal from the scheduler's
//! shared stack instead of randomized peer stealing (this crate's workers
//! never steal from each other's *local* stacks directly — only the
//! scheduler's shared overflow stack is stealable, per spec §3/§4.1).

use std::sync::Arc;
use std::time::Duration;

use crate::mcs_lock::McsNode;
use crate::park::{Parker, ThreadPark};
use crate::scheduler::{Scheduler, steal};
use crate::work::{self, Continuation, Handler, Resume, Work};

/// One OS thread's worker state: a private LIFO work stack, the currently
/// installed failure [`Handler`], and the bookkeeping needed to acquire the
/// scheduler's shared-stack lock and to park/unpark this thread.
pub struct Worker {
    pub(crate) local: Vec<Box<dyn Work>>,
    pub(crate) handler: Option<Arc<dyn Handler>>,
    scheduler: Scheduler,
    node: McsNode,
    parker: Parker<ThreadPark>,
    id: usize,
    /// Bounds how many tail-resumptions this worker will invoke directly
    /// (native-recursion trampolining) before falling back to push-and-return.
    /// Stands in for the spec's `stack_limit`, which assumes the host can
    /// inspect its native stack pointer; see `DESIGN.md`'s Open Questions.
    depth: usize,
    max_depth: usize,
}

/// Default for [`crate::scheduler::SchedulerBuilder::trampoline_depth`], per
/// spec §4.1's trampoline / §9's stack-pointer note and §12's configuration
/// surface: tuned for typical native stack sizes, overridable per scheduler.
pub(crate) const DEFAULT_TRAMPOLINE_DEPTH: usize = 256;

impl Worker {
    pub(crate) fn new(scheduler: Scheduler, id: usize) -> Self {
        let max_depth = scheduler.trampoline_depth();
        Self {
            local: Vec::new(),
            handler: None,
            scheduler,
            node: McsNode::new(),
            parker: Parker::new(ThreadPark::for_current()),
            id,
            depth: 0,
            max_depth,
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Pushes `w` onto this worker's local stack.
    ///
    /// Per spec §4.1's push heuristic: if the local stack already had work
    /// on it *and* the scheduler's shared stack is currently empty, the
    /// older local contents are moved to the shared stack (making them
    /// stealable) before `w` becomes the sole item locally. This keeps the
    /// hottest continuation local (direct-style control flow stays fast)
    /// while still exposing older work to idle peers.
    pub fn push(&mut self, w: Box<dyn Work>) {
        if !self.local.is_empty() {
            let moved = {
                let mut guard = self.scheduler.state_lock(&mut self.node);
                if guard.work_stack.is_empty() {
                    Some(std::mem::take(&mut self.local))
                } else {
                    None
                }
            };
            if let Some(mut older) = moved {
                let n = older.len();
                let mut guard = self.scheduler.state_lock(&mut self.node);
                guard.work_stack.append(&mut older);
                drop(guard);
                tracing::trace!(worker = self.id, moved = n, "exposed older local work to the shared stack");
                self.scheduler.wake_one();
            }
        }
        self.local.push(w);
        tracing::trace!(worker = self.id, depth = self.local.len(), "pushed work onto local stack");
    }

    /// Resumes `cont` with `value`, either immediately (if there is native
    /// stack headroom left in this trampoline's budget) or by pushing a
    /// [`Resume`] work item, per spec §4.1's trampoline / §9's note on
    /// direct invocation vs push-and-return.
    ///
    /// This is how a channel rendezvous or a `choose` commit resumes both
    /// sides without always paying for a round trip through the local
    /// stack — the common case for a short chain of synchronous hand-offs.
    pub fn resume_tail<T: Send + 'static>(&mut self, cont: Box<dyn Continuation<T>>, value: T) {
        if self.depth < self.max_depth {
            self.depth += 1;
            cont.resume(self, value);
        } else {
            self.depth = 0;
            self.push(Box::new(Resume::new(cont, value)));
        }
    }

    /// Runs the trampoline loop until the scheduler signals shutdown and
    /// this worker has nothing left to do.
    pub(crate) fn run(mut self) {
        loop {
            self.drain_local();

            if !self.refill() {
                break;
            }
        }
    }

    /// Drains the local stack, running each item to its next suspension
    /// point. Per spec §4.1 step 1, the loop always re-reads `local` after
    /// running an item, since running it may have pushed more work.
    fn drain_local(&mut self) {
        while let Some(w) = self.local.pop() {
            self.depth = 0;
            tracing::trace!(worker = self.id, remaining = self.local.len(), "popped work from local stack");
            work::run_caught(w, self);
        }
    }

    /// Entered when `local` is empty. Tries to pull work from the shared
    /// stack (stealing a suffix if needed), runs the idle handler and timer
    /// if there's truly nothing anywhere, and parks if even that turns up
    /// nothing. Returns `false` once this worker should exit for good.
    fn refill(&mut self) -> bool {
        loop {
            if self.try_steal_shared() {
                return true;
            }

            // Nothing on the shared stack either. Give any due `after(Δ)`
            // callbacks a chance to produce local work before considering
            // idling or shutdown.
            if let Some(next_deadline) = self.scheduler.clone().timer().turn(self) {
                if !self.local.is_empty() {
                    return true;
                }

                if self.should_exit() {
                    return false;
                }

                self.idle_or_park(Some(next_deadline));
                continue;
            }

            if !self.local.is_empty() {
                return true;
            }

            if self.should_exit() {
                return false;
            }

            self.idle_or_park(None);
        }
    }

    fn try_steal_shared(&mut self) -> bool {
        let mut guard = self.scheduler.state_lock(&mut self.node);
        if guard.work_stack.is_empty() {
            return false;
        }

        let stolen = steal::split_steal(&mut guard.work_stack);
        let remaining = !guard.work_stack.is_empty();
        drop(guard);

        tracing::trace!(worker = self.id, stole = stolen.len(), "stole a suffix of the shared stack");

        if remaining {
            self.scheduler.wake_one();
        }

        self.local.extend(stolen);
        !self.local.is_empty()
    }

    /// Whether this worker may exit its trampoline loop: the scheduler has
    /// asked to wind down, and there is truly nothing left anywhere that
    /// could still produce work on this thread (no pending timers).
    fn should_exit(&self) -> bool {
        self.scheduler.is_stopping() && self.scheduler.timer().is_empty()
    }

    /// Runs the (optional) user idle handler, then parks for whatever is
    /// shorter of its requested timeout and the next timer deadline.
    ///
    /// Registering this worker's unpark token and rechecking the shared
    /// stack happen as one critical section in
    /// [`Scheduler::park_if_still_empty`] — not a separate check here
    /// followed by a separately-locked registration — so a publish-then-
    /// signal race can never land in the gap and cause a lost wakeup (spec
    /// §4.2/§8 "No lost wakeup").
    fn idle_or_park(&mut self, next_deadline: Option<Duration>) {
        let requested = self.scheduler.clone().idle_handler_timeout(self);

        let timeout = match (requested, next_deadline) {
            (Some(ms), _) if ms == 0 => return,
            (Some(ms), Some(deadline)) if ms > 0 => {
                Some(Duration::from_millis(ms as u64).min(deadline))
            }
            (Some(ms), None) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            (Some(_), deadline) => deadline, // negative == infinite unless a timer bounds it
            (None, deadline) => deadline,
        };

        tracing::debug!(worker = self.id, ?timeout, "parking: nothing left anywhere");
        self.scheduler
            .clone()
            .park_if_still_empty(&mut self.node, &self.parker, timeout);
        tracing::trace!(worker = self.id, "woke from park (or found work waiting)");

        if self.should_exit() {
            self.scheduler.wake_one();
        }
    }
}
