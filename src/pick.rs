// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The commit protocol shared by every `choose`.
//!
//! A [`Pick`] is created once per `choose` and shared by every alternative
//! participating in it. Committing a rendezvous between two parties (a
//! giver and a taker, say) means committing *both* sides' picks atomically:
//! if either side's pick has already gone to a different partner, the whole
//! attempt backs off and the scanning alternative moves on to the next
//! waiter in the queue.
//!
//! Alternatives that lose the race (because a sibling alternative in the
//! same `choose` won instead) are notified via a *nack*: a closure queued at
//! enqueue time and run, on the winning worker, for every losing id once the
//! pick commits. This is how `with_nack` (see [`crate::alt`]) lets a losing
//! alternative release a resource it had provisionally claimed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::worker::Worker;

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;

type NackFn = Box<dyn FnOnce(&mut Worker) + Send>;

/// Shared commit state for one `choose`.
pub struct Pick {
    state: AtomicU8,
    nacks: Mutex<Vec<(usize, NackFn)>>,
}

impl Pick {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(OPEN),
            nacks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMMITTED
    }

    /// Registers a callback to run if `id` does not end up being the
    /// alternative this pick commits to.
    pub fn register_nack(&self, id: usize, nack: impl FnOnce(&mut Worker) + Send + 'static) {
        self.nacks.lock().push((id, Box::new(nack)));
    }

    /// Runs every registered nack except `winner`'s, on `worker`.
    pub(crate) fn fire_nacks(&self, winner: usize, worker: &mut Worker) {
        let callbacks = std::mem::take(&mut *self.nacks.lock());
        for (id, nack) in callbacks {
            if id != winner {
                nack(worker);
            }
        }
    }

    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(OPEN, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unclaim(&self) {
        self.state.store(OPEN, Ordering::Release);
    }

    /// Commits this pick without a partner, for alternatives (`always`,
    /// `after`, ...) that don't rendezvous with another pick.
    pub(crate) fn try_commit_alone(&self) -> bool {
        self.try_claim()
    }
}

/// Commits both `a` and `b` atomically, or neither.
///
/// The two picks are claimed in a fixed order (by `Arc` address) so two
/// workers racing to commit the same pair of picks from opposite directions
/// can never deadlock against each other.
pub(crate) fn commit_pair(a: &Arc<Pick>, b: &Arc<Pick>) -> bool {
    if Arc::ptr_eq(a, b) {
        // A pick synchronizing with itself (e.g. both sides of a choose
        // reference the same pending pick) is never a valid commit.
        return false;
    }

    let (first, second) = if Arc::as_ptr(a) < Arc::as_ptr(b) {
        (a, b)
    } else {
        (b, a)
    };

    if !first.try_claim() {
        return false;
    }
    if !second.try_claim() {
        first.unclaim();
        return false;
    }
    tracing::debug!("pick committed to a rendezvous between two picks");
    true
}
