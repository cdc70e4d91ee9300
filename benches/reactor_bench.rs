//! Performance benchmarks for the reactor and the future layer.
//!
//! Run with: `cargo bench`
//! Or for a specific bench: `cargo bench --bench reactor_bench`

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lockstep::future::{when_all, Promise};
use lockstep::reactor::Reactor;

/// Queue N immediate events and drain them in a single run.
fn bench_immediate_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("immediate_dispatch");
    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let reactor = Reactor::new();
                let hits = Rc::new(Cell::new(0u64));
                for _ in 0..count {
                    let hits = Rc::clone(&hits);
                    reactor.add_immediate_event(move |_| {
                        hits.set(hits.get() + 1);
                        Ok(())
                    });
                }
                reactor.run().unwrap();
                black_box(hits.get())
            });
        });
    }
    group.finish();
}

/// Register N timers that each fire once immediately.
fn bench_timer_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_dispatch");
    for count in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let reactor = Reactor::new();
                let hits = Rc::new(Cell::new(0u64));
                for _ in 0..count {
                    let hits = Rc::clone(&hits);
                    reactor
                        .add_timer(Duration::from_millis(0), 1, move |_, _| {
                            hits.set(hits.get() + 1);
                            Ok(())
                        })
                        .unwrap();
                }
                reactor.run().unwrap();
                black_box(hits.get())
            });
        });
    }
    group.finish();
}

/// Resolve N promises joined by `when_all`.
fn bench_when_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("when_all");
    for count in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let reactor = Reactor::new();
                let mut promises: Vec<Promise<u64>> =
                    (0..count).map(|_| Promise::new(&reactor)).collect();
                let futures = promises
                    .iter_mut()
                    .map(|p| p.get_future().unwrap())
                    .collect();
                let joined = when_all(&reactor, futures);
                let total = Rc::new(Cell::new(0u64));
                let t = Rc::clone(&total);
                joined.on_completion(
                    move |results| {
                        t.set(results.into_iter().flatten().sum());
                        Ok(())
                    },
                    |e| Err(e),
                );
                for (i, promise) in promises.iter_mut().enumerate() {
                    promise.set_value(i as u64).unwrap();
                }
                reactor.run().unwrap();
                black_box(total.get())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_immediate_dispatch,
    bench_timer_dispatch,
    bench_when_all
);
criterion_main!(benches);
