use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use nonzero_ext::nonzero;
use tollgate::{
    AdmissionControl, Bucket, Composite, ConsumptionPolicy, Limit, ManualClock, Nanos,
};

fn big_limit() -> Limit {
    Limit::new(nonzero!(1_000_000u64), Duration::from_secs(1))
        .with_max_tokens(i64::MAX as u64)
        .with_initial_tokens(i64::MAX as u64)
}

fn pinned_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Nanos::from_nanos(10_000_000_000)))
}

fn bench_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    group
        .throughput(Throughput::Elements(1))
        .sample_size(100)
        .bench_function("bucket-try-consume", |b| {
            let bucket = Bucket::with_clock(vec![big_limit()], pinned_clock()).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(bucket.try_consume(nonzero!(1u64)));
            });
        })
        .bench_function("bucket-try-consume-two-limits", |b| {
            let bucket =
                Bucket::with_clock(vec![big_limit(), big_limit()], pinned_clock()).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(bucket.try_consume(nonzero!(1u64)));
            });
        })
        .bench_function("bucket-std-clock", |b| {
            let bucket = Bucket::new(vec![big_limit()]).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(bucket.try_consume(nonzero!(1u64)));
            });
        })
        .bench_function("bucket-available", |b| {
            let bucket = Bucket::with_clock(vec![big_limit()], pinned_clock()).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(bucket.available_tokens());
            });
        })
        .bench_function("composite-round-robin", |b| {
            let clock = pinned_clock();
            let children: Vec<Arc<dyn AdmissionControl>> = vec![
                Bucket::with_clock(vec![big_limit()], clock.clone()).unwrap(),
                Bucket::with_clock(vec![big_limit()], clock.clone()).unwrap(),
            ];
            let pool =
                Composite::with_clock(children, ConsumptionPolicy::round_robin(), clock).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(pool.try_consume(nonzero!(1u64)));
            });
        })
        .bench_function("composite-from-all", |b| {
            let clock = pinned_clock();
            let children: Vec<Arc<dyn AdmissionControl>> = vec![
                Bucket::with_clock(vec![big_limit()], clock.clone()).unwrap(),
                Bucket::with_clock(vec![big_limit()], clock.clone()).unwrap(),
            ];
            let pool =
                Composite::with_clock(children, ConsumptionPolicy::ConsumeFromAll, clock).unwrap();
            b.iter(|| {
                let _x = std::hint::black_box(pool.try_consume(nonzero!(1u64)));
            });
        });
    group.finish();
}

criterion_group!(benches, bench_consume);
criterion_main!(benches);
