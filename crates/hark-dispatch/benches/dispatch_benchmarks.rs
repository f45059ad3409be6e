//! Dispatch round-trip latency.
//!
//! Measures `handle()` from the calling thread through the worker queue and
//! back, and the cost of arming plus cancelling a wait-until timer on every
//! transition.

use std::fmt;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use hark_dispatch::{Message, StateId, StateMachineBuilder, TimerService};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Phase {
    Idle,
    Busy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl StateId for Phase {
    const ALL: &'static [Self] = &[Phase::Idle, Phase::Busy];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Ev {
    Ping,
    Flip,
    Expired,
}

struct Msg(Ev);

impl Message for Msg {
    type Event = Ev;

    fn event(&self) -> Ev {
        self.0
    }

    fn timeout(event: Ev) -> Self {
        Msg(event)
    }
}

fn bench_round_trip(c: &mut Criterion) {
    let timer = TimerService::new(16);
    timer.start("bench-timer").unwrap_or_else(|e| panic!("{e}"));

    let mut builder: StateMachineBuilder<u64, Phase, Msg, u64> =
        StateMachineBuilder::new("bench", Phase::Idle);
    builder
        .for_range(Phase::Idle, Phase::Busy)
        .on(Ev::Ping, |count, _t, _m| {
            *count += 1;
            Ok(*count)
        });
    builder.for_state(Phase::Idle).on(Ev::Flip, |_c, t, _m| {
        t.go(Phase::Busy);
        Ok(0)
    });
    builder
        .for_state(Phase::Busy)
        .wait_until(
            Ev::Expired,
            |_c, t, _m| {
                t.go(Phase::Idle);
                Ok(0)
            },
            Duration::from_secs(60),
        )
        .on(Ev::Flip, |_c, t, _m| {
            t.go(Phase::Idle);
            Ok(1)
        });

    let machine = builder
        .spawn(0, timer.clone())
        .unwrap_or_else(|e| panic!("{e}"));

    let mut group = c.benchmark_group("dispatch");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("handle_round_trip", |b| {
        b.iter(|| black_box(machine.handle(Msg(Ev::Ping)).ok()))
    });

    group.bench_function("transition_with_wait_until", |b| {
        b.iter(|| black_box(machine.handle(Msg(Ev::Flip)).ok()))
    });

    group.finish();
    drop(machine);
    timer.stop();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
