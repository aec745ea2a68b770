// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the runtime as a whole, rather than one
//! module in isolation. Scaled down from production-scale job/client counts
//! so the suite stays fast; the invariants being checked don't depend on
//! scale.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rendezvous::alt::{Nack, always, choose, never, sync, with_nack, wrap, wrap_abort};
use rendezvous::channel::Channel;
use rendezvous::scheduler::Scheduler;
use rendezvous::work::{FnJob, JobExt, with_handler};
use rendezvous::{Failure, Worker, run};

/// Scenario 1: a "cell" channel holds exactly one pending value at a time;
/// many concurrent clients each take the current value and put back an
/// increment. Since the channel never buffers more than one value, clients
/// are fully serialized against each other — the final value is exactly
/// `initial + CLIENTS`, with no lost or duplicated updates.
#[test]
fn cell_server_serializes_concurrent_clients() {
    const CLIENTS: u32 = 200;

    let scheduler = Scheduler::builder().worker_count(4).build();
    let cell: Channel<u32> = Channel::new();

    let seed = cell.clone();
    let _ = scheduler.spawn(sync(seed.give(0)).map(|(), _w| ()));

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..CLIENTS {
        let cell = cell.clone();
        let completed = completed.clone();
        let _ = scheduler.spawn(sync(cell.take()).then(move |v, _w| {
            sync(cell.give(v + 1)).map(move |(), _w| {
                completed.fetch_add(1, Ordering::Relaxed);
            })
        }));
    }

    let final_value = Arc::new(Mutex::new(None));
    let final_value2 = final_value.clone();
    let cell = cell.clone();
    let _ = scheduler.spawn(sync(cell.take()).map(move |v, _w| {
        *final_value2.lock().unwrap() = Some(v);
    }));

    scheduler.shutdown_on_idle();
    scheduler.join();

    assert_eq!(completed.load(Ordering::Relaxed), CLIENTS as usize);
    assert_eq!(*final_value.lock().unwrap(), Some(CLIENTS));
}

/// Scenario 2: two jobs each offer `choose([give(a, 1), take(b)])`; a third
/// job takes from `a` and, once it has, gives on `b`. Exactly one chooser
/// wins the `a` branch (racing the third job's take); the other can only
/// complete via the `b` branch, and only after the third job's give.
#[test]
fn selective_give_or_take_resolves_through_a_then_b() {
    let scheduler = Scheduler::builder().worker_count(4).build();
    let a: Channel<u32> = Channel::new();
    let b: Channel<u32> = Channel::new();

    let results: Arc<Mutex<Vec<(u32, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));

    for id in [1u32, 2u32] {
        let a = a.clone();
        let b = b.clone();
        let results = results.clone();
        let branch_a = wrap(a.give(1), move |(), _w| (id, "a"));
        let branch_b = wrap(b.take(), move |_v, _w| (id, "b"));
        let _ = scheduler.spawn(choose((branch_a, branch_b)).map(move |outcome, _w| {
            results.lock().unwrap().push(outcome);
        }));
    }

    let a2 = a.clone();
    let b2 = b;
    let _ = scheduler.spawn(sync(a2.take()).then(move |_v, _w| sync(b2.give(99)).map(|(), _w| ())));

    scheduler.shutdown_on_idle();
    scheduler.join();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    let via_a = results.iter().filter(|(_, branch)| *branch == "a").count();
    let via_b = results.iter().filter(|(_, branch)| *branch == "b").count();
    assert_eq!(via_a, 1, "exactly one chooser should win the `a` race");
    assert_eq!(via_b, 1, "the loser can only complete via `b`");
}

/// Scenario 3: a `wrap_abort` branch that never completes on its own is
/// paired with a sibling that always wins immediately. The abort job must
/// run exactly once, releasing whatever the losing branch had provisionally
/// claimed.
#[test]
fn nack_releases_resource_exactly_once_when_losing() {
    let scheduler = Scheduler::builder().worker_count(1).build();
    let released = Arc::new(AtomicUsize::new(0));
    let released2 = released.clone();

    let losing_branch = wrap_abort(
        never::<u32>(),
        FnJob::new(move |_w| {
            released2.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let _ = scheduler.spawn(choose((losing_branch, always(0u32))).map(|_, _w| ()));

    scheduler.shutdown_on_idle();
    scheduler.join();

    assert_eq!(released.load(Ordering::SeqCst), 1);
}

/// Scenario 3b: `with_nack`'s nack alternative is itself selectable, not
/// just a post-loss callback. A second job synchronizes on the nack handed
/// to the losing branch's builder, and only observes it fire once the
/// sibling branch has actually won.
#[test]
fn with_nack_alt_becomes_available_once_sibling_wins() {
    let scheduler = Scheduler::builder().worker_count(4).build();
    let watcher_scheduler = scheduler.clone();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();

    let losing_branch = with_nack(move |nack: Nack| {
        let fired3 = fired2.clone();
        let _ = watcher_scheduler.spawn(sync(nack).map(move |(), _w| {
            fired3.fetch_add(1, Ordering::SeqCst);
        }));
        never::<u32>()
    });
    let _ = scheduler.spawn(choose((losing_branch, always(0u32))).map(|_, _w| ()));

    scheduler.shutdown_on_idle();
    scheduler.join();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Scenario 4: `choose([take(ch), after(Δ) |> always("timeout")])` with no
/// giver on `ch` resolves via the timeout branch once `Δ` elapses, and the
/// stale `ch` waiter is simply abandoned (cleaned up lazily, not leaked as
/// a correctness issue — see `DESIGN.md`).
#[test]
fn timeout_race_fires_without_a_giver() {
    let ch: Channel<&'static str> = Channel::new();
    let started = std::time::Instant::now();

    let result = run(choose((ch.take(), wrap(rendezvous::alt::after(Duration::from_millis(20)), |(), _w| "timeout"))));

    assert_eq!(result, "timeout");
    assert!(started.elapsed() >= Duration::from_millis(20));
}

/// Scenario 5: many jobs, each doing exactly one give and one take across a
/// shared pair of channels, all complete promptly.
#[test]
fn many_jobs_one_give_one_take_each_complete() {
    const PAIRS: u32 = 300;

    let scheduler = Scheduler::builder().worker_count(4).build();
    let a: Channel<u32> = Channel::new();
    let b: Channel<u32> = Channel::new();
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 0..PAIRS {
        let a = a.clone();
        let b = b.clone();
        let completed = completed.clone();
        let _ = scheduler.spawn(sync(a.give(i)).then(move |(), _w| {
            sync(b.take()).map(move |_, _w| {
                completed.fetch_add(1, Ordering::Relaxed);
            })
        }));

        let a = a.clone();
        let b = b.clone();
        let completed = completed.clone();
        let _ = scheduler.spawn(sync(a.take()).then(move |v, _w| {
            sync(b.give(v)).map(move |(), _w| {
                completed.fetch_add(1, Ordering::Relaxed);
            })
        }));
    }

    scheduler.shutdown_on_idle();
    scheduler.join();

    assert_eq!(completed.load(Ordering::Relaxed), (PAIRS * 2) as usize);
}

/// Scenario 6: a panicking job's failure is delivered to the handler
/// installed by its own nearest enclosing `with_handler`, not to an
/// unrelated job sharing the same worker — and the unrelated job still
/// runs to completion unaffected.
#[test]
fn panic_attributes_to_its_own_handler_not_an_unrelated_job() {
    let scheduler = Scheduler::builder().worker_count(1).build();

    let caught = Arc::new(AtomicBool::new(false));
    let caught2 = caught.clone();
    let handler = move |_w: &mut Worker, _failure: Failure| {
        caught2.store(true, Ordering::SeqCst);
    };

    let _ = scheduler.spawn(with_handler(
        FnJob::new(|_w| -> () { panic!("scenario 6 boom") }),
        handler,
    ));

    let unrelated_ran = Arc::new(AtomicBool::new(false));
    let unrelated_ran2 = unrelated_ran.clone();
    let _ = scheduler.spawn(FnJob::new(move |_w| {
        unrelated_ran2.store(true, Ordering::SeqCst);
    }));

    scheduler.shutdown_on_idle();
    scheduler.join();

    assert!(caught.load(Ordering::SeqCst), "panic should reach its own handler");
    assert!(
        unrelated_ran.load(Ordering::SeqCst),
        "an unrelated job on the same worker must still run"
    );
}
