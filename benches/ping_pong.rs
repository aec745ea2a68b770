// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use rendezvous::alt::sync;
use rendezvous::channel::Channel;
use rendezvous::scheduler::Scheduler;
use rendezvous::work::{FnJob, Job, JobExt};

const ROUNDS: usize = 1_000;

fn giver_loop(ping: Channel<u32>, pong: Channel<u32>, n: usize) -> Box<dyn Job<()>> {
    if n >= ROUNDS {
        return Box::new(FnJob::new(|_w| ()));
    }
    Box::new(sync(ping.give(n as u32)).then(move |(), _w| {
        sync(pong.take()).then(move |_, _w| giver_loop(ping, pong, n + 1))
    }))
}

fn taker_loop(ping: Channel<u32>, pong: Channel<u32>, n: usize) -> Box<dyn Job<()>> {
    if n >= ROUNDS {
        return Box::new(FnJob::new(|_w| ()));
    }
    Box::new(sync(ping.take()).then(move |_, _w| {
        sync(pong.give(n as u32)).then(move |(), _w| taker_loop(ping, pong, n + 1))
    }))
}

fn ping_pong_single_worker(c: &mut Criterion) {
    c.bench_function("ping_pong_1k_rounds_single_worker", |b| {
        b.iter(|| {
            let scheduler = Scheduler::builder().worker_count(1).build();
            let ping: Channel<u32> = Channel::new();
            let pong: Channel<u32> = Channel::new();

            let _ = scheduler.spawn(giver_loop(ping.clone(), pong.clone(), 0));
            let _ = scheduler.spawn(taker_loop(ping, pong, 0));

            scheduler.shutdown_on_idle();
            scheduler.join();
        });
    });
}

fn ping_pong_two_workers(c: &mut Criterion) {
    c.bench_function("ping_pong_1k_rounds_two_workers", |b| {
        b.iter(|| {
            let scheduler = Scheduler::builder().worker_count(2).build();
            let ping: Channel<u32> = Channel::new();
            let pong: Channel<u32> = Channel::new();

            let _ = scheduler.spawn(giver_loop(ping.clone(), pong.clone(), 0));
            let _ = scheduler.spawn(taker_loop(ping, pong, 0));

            scheduler.shutdown_on_idle();
            scheduler.join();
        });
    });
}

criterion_group!(benches, ping_pong_single_worker, ping_pong_two_workers);
criterion_main!(benches);
