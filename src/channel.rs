// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronous, selectable rendezvous channels.
//!
//! A [`Channel<T>`] has no buffer: a `give` only completes once some `take`
//! is ready to receive the same value, and vice versa. Both sides are
//! expressed as [`Alternative`]s (see [`crate::alt`]), so either side can
//! always be composed into a `choose` alongside other channels, timeouts, or
//! synthetic alternatives, per spec §4.4/§4.5.
//!
//! Waiters queue on `cordyceps::List`, the same intrusive-list tool the
//! teacher crate uses for its own wait queues, guarded by a `spin::Mutex`
//! (again matching the teacher's `sync::wait_queue` pattern) since critical
//! sections here are a handful of pointer operations.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cordyceps::{list, List};
use spin::Mutex;

use crate::alt::Alternative;
use crate::error::{Closed, Failure};
use crate::pick::Pick;
use crate::work::Continuation;
use crate::worker::Worker;

struct GiverNode<T> {
    links: list::Links<GiverNode<T>>,
    pick: Arc<Pick>,
    id: usize,
    slot: Mutex<Option<(T, Box<dyn Continuation<()>>)>>,
}

unsafe impl<T: Send + 'static> list::Linked<list::Links<GiverNode<T>>> for GiverNode<T> {
    type Handle = Box<GiverNode<T>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        Box::from_raw(ptr.as_ptr())
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<GiverNode<T>>> {
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        NonNull::new_unchecked(links)
    }
}

struct TakerNode<T> {
    links: list::Links<TakerNode<T>>,
    pick: Arc<Pick>,
    id: usize,
    slot: Mutex<Option<Box<dyn Continuation<T>>>>,
}

unsafe impl<T: Send + 'static> list::Linked<list::Links<TakerNode<T>>> for TakerNode<T> {
    type Handle = Box<TakerNode<T>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        Box::from_raw(ptr.as_ptr())
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<TakerNode<T>>> {
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        NonNull::new_unchecked(links)
    }
}

struct Inner<T> {
    givers: Mutex<List<GiverNode<T>>>,
    takers: Mutex<List<TakerNode<T>>>,
    closed: AtomicUsize,
}

/// A synchronous rendezvous channel.
///
/// Cloning a `Channel` shares the same underlying queue pair; there is no
/// capacity and no buffering, matching the spec's "Channel" component.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Channel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                givers: Mutex::new(List::new()),
                takers: Mutex::new(List::new()),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    /// An alternative that synchronizes by handing `value` to a waiting
    /// taker.
    pub fn give(&self, value: T) -> Give<T> {
        Give {
            chan: self.clone(),
            value,
        }
    }

    /// An alternative that synchronizes by receiving a value from a waiting
    /// giver.
    pub fn take(&self) -> Take<T> {
        Take {
            chan: self.clone(),
        }
    }

    /// Marks the channel closed. Waiters already queued are left to be
    /// cleaned up as their picks resolve or are dropped; new `give`/`take`
    /// attempts observe `Closed` immediately.
    pub fn close(&self) {
        self.inner.closed.store(1, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) != 0
    }

    /// Scans queued takers for one whose pick can be committed alongside
    /// ours. On success, returns the matched taker's continuation (still
    /// owed a `resume`); the caller is responsible for scheduling it.
    fn try_give(&self, worker: &mut Worker, pick: &Arc<Pick>, id: usize) -> Option<Box<dyn Continuation<T>>> {
        let mut takers = self.inner.takers.lock();
        loop {
            let taker: Box<TakerNode<T>> = takers.pop_front()?;

            if taker.pick.is_committed() {
                continue;
            }
            if !crate::pick::commit_pair(pick, &taker.pick) {
                continue;
            }

            pick.fire_nacks(id, worker);
            taker.pick.fire_nacks(taker.id, worker);
            tracing::debug!(giver_branch = id, taker_branch = taker.id, "give rendezvoused with a waiting taker");

            return Some(
                taker
                    .slot
                    .lock()
                    .take()
                    .expect("committed taker always holds its continuation"),
            );
        }
    }

    fn enqueue_give(&self, pick: Arc<Pick>, id: usize, value: T, k: Box<dyn Continuation<()>>) {
        let node = Box::new(GiverNode {
            links: list::Links::new(),
            pick,
            id,
            slot: Mutex::new(Some((value, k))),
        });
        self.inner.givers.lock().push_back(node);
    }

    /// Scans queued givers for one whose pick can be committed alongside
    /// ours. On success, returns the matched value plus the giver's
    /// continuation (still owed a `resume`).
    fn try_take(&self, worker: &mut Worker, pick: &Arc<Pick>, id: usize) -> Option<(T, Box<dyn Continuation<()>>)> {
        let mut givers = self.inner.givers.lock();
        loop {
            let giver: Box<GiverNode<T>> = givers.pop_front()?;

            if giver.pick.is_committed() {
                continue;
            }
            if !crate::pick::commit_pair(pick, &giver.pick) {
                continue;
            }

            pick.fire_nacks(id, worker);
            giver.pick.fire_nacks(giver.id, worker);
            tracing::debug!(taker_branch = id, giver_branch = giver.id, "take rendezvoused with a waiting giver");

            return Some(
                giver
                    .slot
                    .lock()
                    .take()
                    .expect("committed giver always holds its value and continuation"),
            );
        }
    }

    fn enqueue_take(&self, pick: Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        let node = Box::new(TakerNode {
            links: list::Links::new(),
            pick,
            id,
            slot: Mutex::new(Some(k)),
        });
        self.inner.takers.lock().push_back(node);
    }
}

/// The give side of a [`Channel`], as an [`Alternative`].
pub struct Give<T> {
    chan: Channel<T>,
    value: T,
}

impl<T: Send + 'static> Alternative<()> for Give<T> {
    #[tracing::instrument(level = "trace", skip_all, fields(branch = id))]
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<()>>) {
        if self.chan.is_closed() {
            k.fail(worker, Failure::new(Box::new(Closed(()))));
            return;
        }

        match self.chan.try_give(worker, pick, id) {
            Some(taker_k) => {
                worker.resume_tail(taker_k, self.value);
                worker.resume_tail(k, ());
            }
            None => {
                tracing::trace!(branch = id, "no waiting taker yet, enqueuing giver");
                self.chan.enqueue_give(pick.clone(), id, self.value, k);
            }
        }
    }
}

/// The take side of a [`Channel`], as an [`Alternative`].
pub struct Take<T> {
    chan: Channel<T>,
}

impl<T: Send + 'static> Alternative<T> for Take<T> {
    #[tracing::instrument(level = "trace", skip_all, fields(branch = id))]
    fn sync(self: Box<Self>, worker: &mut Worker, pick: &Arc<Pick>, id: usize, k: Box<dyn Continuation<T>>) {
        if self.chan.is_closed() {
            k.fail(worker, Failure::new(Box::new(Closed(()))));
            return;
        }

        match self.chan.try_take(worker, pick, id) {
            Some((value, giver_k)) => {
                worker.resume_tail(giver_k, ());
                worker.resume_tail(k, value);
            }
            None => {
                tracing::trace!(branch = id, "no waiting giver yet, enqueuing taker");
                self.chan.enqueue_take(pick.clone(), id, k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alt::{choose, sync};
    use crate::scheduler::Scheduler;
    use crate::work::{FnJob, JobExt};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn give_and_take_rendezvous() {
        let scheduler = Scheduler::builder().worker_count(2).build();
        let chan: Channel<u32> = Channel::new();
        let result = Arc::new(AtomicU32::new(0));

        let giver_chan = chan.clone();
        scheduler.spawn(sync(giver_chan.give(7)).map(|_, _w| ()));

        let taker_chan = chan.clone();
        let result2 = result.clone();
        scheduler.spawn(sync(taker_chan.take()).map(move |v, _w| {
            result2.store(v, Ordering::SeqCst);
        }));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(result.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn choose_picks_whichever_is_ready() {
        let scheduler = Scheduler::builder().worker_count(2).build();
        let a: Channel<u32> = Channel::new();
        let b: Channel<u32> = Channel::new();
        let got = Arc::new(AtomicU32::new(0));

        let a2 = a.clone();
        scheduler.spawn(sync(a2.give(1)).map(|_, _w| ()));

        let got2 = got.clone();
        scheduler.spawn(choose((a.take(), b.take())).map(move |v, _w| {
            got2.store(v, Ordering::SeqCst);
        }));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn give_on_closed_channel_fails() {
        let scheduler = Scheduler::builder().worker_count(1).build();
        let chan: Channel<u32> = Channel::new();
        chan.close();
        let failed = Arc::new(AtomicU32::new(0));
        let failed2 = failed.clone();

        let job = FnJob::new(move |_w| ());
        let _ = job;
        scheduler.spawn(sync(chan.give(1)).map_err(move |_, _w| {
            failed2.store(1, Ordering::SeqCst);
        }));

        scheduler.shutdown_on_idle();
        scheduler.join();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
