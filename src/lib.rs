// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A Concurrent ML style work-stealing scheduler with synchronous,
//! selectable channels.
//!
//! The runtime has two halves:
//!
//! - A work-stealing [`scheduler`]/[`worker`] pair: a [`Scheduler`] owns a
//!   shared overflow stack and a pool of OS threads, each running a
//!   [`Worker`] trampoline over a private LIFO stack of [`work::Work`] items.
//! - Synchronous [`channel`]s and the [`alt`] selective-choice algebra built
//!   on top of them, committed via the two-phase protocol in [`pick`].
//!
//! Jobs are direct-style, continuation-passing computations (see
//! [`work::Job`]/[`work::Continuation`]), not `Future`s: a job suspends only
//! at a channel give/take that finds no partner, or a `choose` that doesn't
//! commit immediately, and resumes by being handed straight back to a
//! worker's trampoline rather than being polled.

mod error;
mod mcs_lock;
mod park;

pub mod alt;
pub mod channel;
pub mod pick;
mod run;
pub mod scheduler;
pub mod time;
pub mod work;
pub mod worker;

pub use alt::{Alternative, Nack, after, always, choose, guard, never, sync, with_nack, wrap, wrap_abort};
pub use channel::Channel;
pub use error::{Closed, Failure, RecvError, SpawnError};
pub use run::run;
pub use scheduler::{IdleHandler, Scheduler, SchedulerBuilder, TopLevelHandler};
pub use work::{Continuation, Handler, Job, JobExt, with_handler};
pub use worker::Worker;
