// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler lock.
//!
//! The spec calls for a lock protecting the scheduler's shared work stack and
//! waiter stack whose hold times are O(1) outside of the (rare) stealing
//! walk, and explicitly permits an MCS queue lock. Plain `spin::Mutex` would
//! work too, but every `Worker` already carries a preallocated `McsNode` (see
//! spec §3/§4.2), so this module gives that field somewhere real to live
//! instead of being spec-decoration that nothing uses.

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// A per-worker node used while this worker is queued on a [`McsLock`].
///
/// Each `Worker` preallocates exactly one of these and reuses it for every
/// acquisition; the lock is not reentrant, so a worker must never attempt to
/// acquire a second `McsLock` (or the same one again) while already queued.
#[derive(Debug)]
pub struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
}

impl McsNode {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutual-exclusion lock implemented as an MCS queue lock.
///
/// Unlike a plain test-and-set spinlock, waiters spin on their own cache line
/// (`node.locked`) rather than on shared state, so contention does not cause
/// cache-line ping-pong across cores. This matters here because the lock
/// guards the scheduler's shared stack, which every idle worker contends for.
#[derive(Debug)]
pub struct McsLock<T> {
    tail: AtomicPtr<McsNode>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is only ever granted through a `McsGuard`, which
// is only constructed while holding the lock.
unsafe impl<T: Send> Send for McsLock<T> {}
unsafe impl<T: Send> Sync for McsLock<T> {}

impl<T> McsLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, queueing behind `node` if it is already held.
    ///
    /// `node` must not be shared with, or concurrently used by, any other
    /// thread for the duration of the returned guard's lifetime.
    pub fn lock<'a>(&'a self, node: &'a mut McsNode) -> McsGuard<'a, T> {
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.locked.store(true, Ordering::Relaxed);

        let node_ptr: *mut McsNode = node;
        let prev = self.tail.swap(node_ptr, Ordering::AcqRel);

        if !prev.is_null() {
            // Safety: `prev` was a live node installed by a still-queued
            // predecessor; it cannot be freed until it unlinks itself below.
            unsafe {
                (*prev).next.store(node_ptr, Ordering::Release);
            }

            while node.locked.load(Ordering::Acquire) {
                hint::spin_loop();
            }
        }

        McsGuard {
            lock: self,
            node: node_ptr,
        }
    }

    fn unlock(&self, node_ptr: *mut McsNode) {
        // Safety: `node_ptr` came from a live `&mut McsNode` for the
        // lifetime of the matching `McsGuard`.
        let node = unsafe { &*node_ptr };

        if node.next.load(Ordering::Acquire).is_null() {
            if self
                .tail
                .compare_exchange(node_ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            // A successor is in the process of linking itself; wait for it
            // to finish so we don't miss handing off the lock.
            while node.next.load(Ordering::Acquire).is_null() {
                hint::spin_loop();
            }
        }

        let next = node.next.load(Ordering::Acquire);
        // Safety: non-null per the check above, and kept alive by its own
        // still-queued owner.
        unsafe {
            (*next).locked.store(false, Ordering::Release);
        }
    }
}

/// RAII guard granting exclusive access to the data behind a [`McsLock`].
pub struct McsGuard<'a, T> {
    lock: &'a McsLock<T>,
    node: *mut McsNode,
}

impl<T> Deref for McsGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard implies holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for McsGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard implies holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for McsGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.node);
    }
}
