// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `after(Δ)`'s backing timer.
//!
//! The teacher's `time/timer.rs` is a hierarchical wheel built to serve a
//! general-purpose async-sleep API with many thousands of live timers. This
//! crate only ever needs "fire a callback on a worker once a deadline
//! passes", so `Timer` here is the simplest thing that does that: a
//! mutex-protected `Vec` of deadlines, turned once per worker idle cycle (see
//! [`crate::worker::Worker`]'s idle state) rather than driven by its own
//! thread or interrupt.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::Failure;
use crate::worker::Worker;

type Callback = Box<dyn FnOnce(&mut Worker) + Send>;

struct Entry {
    deadline: Instant,
    callback: Callback,
}

/// Holds every not-yet-fired [`crate::alt::after`] deadline for one
/// [`crate::scheduler::Scheduler`].
#[derive(Default)]
pub struct Timer {
    entries: Mutex<Vec<Entry>>,
}

impl Timer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers `callback` to run on some worker once `after` elapses.
    pub fn schedule(&self, after: Duration, callback: impl FnOnce(&mut Worker) + Send + 'static) {
        let deadline = Instant::now() + after;
        self.entries.lock().push(Entry {
            deadline,
            callback: Box::new(callback),
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fires every callback whose deadline has passed, running each on
    /// `worker`. Returns the duration until the next still-pending deadline,
    /// or `None` if no deadlines remain.
    ///
    /// A panicking callback is caught and routed to `worker`'s failure
    /// handler the same way a panicking [`crate::work::Work`] item is,
    /// rather than propagating into the worker's idle loop.
    pub(crate) fn turn(&self, worker: &mut Worker) -> Option<Duration> {
        let now = Instant::now();
        let due = {
            let mut entries = self.entries.lock();
            let mut due = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].deadline <= now {
                    due.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };

        for entry in due {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                (entry.callback)(worker);
            }));
            if let Err(payload) = result {
                crate::work::fail_work(worker, Failure::new(payload));
            }
        }

        self.entries
            .lock()
            .iter()
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }
}
