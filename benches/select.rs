// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Throughput of a `choose` over many branches, most of which never fire.

use criterion::{Criterion, criterion_group, criterion_main};
use rendezvous::alt::{Alternative, choose, never, sync};
use rendezvous::channel::Channel;
use rendezvous::scheduler::Scheduler;
use rendezvous::work::JobExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const BRANCHES: usize = 16;
const ROUNDS: usize = 200;

fn select_among_many_dead_branches(c: &mut Criterion) {
    c.bench_function("select_16_branches_1_live_200_rounds", |b| {
        b.iter(|| {
            let scheduler = Scheduler::builder().worker_count(2).build();
            let winner: Channel<u32> = Channel::new();
            let done = Arc::new(AtomicUsize::new(0));

            for _ in 0..ROUNDS {
                let giver = winner.clone();
                let _ = scheduler.spawn(sync(giver.give(1)).map(|_, _w| ()));

                let mut alts: Vec<Box<dyn Alternative<u32>>> = Vec::with_capacity(BRANCHES);
                alts.push(Box::new(winner.take()));
                for _ in 1..BRANCHES {
                    alts.push(Box::new(never()));
                }

                let done = done.clone();
                let _ = scheduler.spawn(choose(alts).map(move |_, _w| {
                    done.fetch_add(1, Ordering::Relaxed);
                }));
            }

            scheduler.shutdown_on_idle();
            scheduler.join();
            assert_eq!(done.load(Ordering::Relaxed), ROUNDS);
        });
    });
}

criterion_group!(benches, select_among_many_dead_branches);
criterion_main!(benches);
